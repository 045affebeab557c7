//! Timer-driven reminder tasks around a [`Session`].
//!
//! Two tasks may run: the periodic check (immediately, then every
//! `check_interval`) while reminders are enabled, and the alert repeat (every
//! `alert_repeat`) while an alert is active. Both, and every API call, go through
//! one mutex, and tasks are aborted while that mutex is held, so a stale tick can
//! never act on another user's data.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::alert::{Alert, AlertDispatcher};
use crate::clock::Clock;
use crate::session::{Session, SessionError};

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_ALERT_REPEAT: Duration = Duration::from_millis(2_400);

#[derive(Clone, Copy, Debug)]
pub struct RuntimeConfig {
    pub check_interval: Duration,
    pub alert_repeat: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            alert_repeat: DEFAULT_ALERT_REPEAT,
        }
    }
}

pub struct Shared {
    pub session: Session,
    check_task: Option<JoinHandle<()>>,
    alert_task: Option<JoinHandle<()>>,
}

impl Shared {
    fn stop_check_loop(&mut self) {
        if let Some(task) = self.check_task.take() {
            task.abort();
            debug!("reminder check loop stopped");
        }
    }

    fn stop_alert_loop(&mut self) {
        if let Some(task) = self.alert_task.take() {
            task.abort();
        }
    }
}

struct Inner {
    shared: Mutex<Shared>,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<dyn AlertDispatcher>,
    config: RuntimeConfig,
}

/// Cloneable handle to the running timetable; the HTTP layer holds one.
#[derive(Clone)]
pub struct TimetableService {
    inner: Arc<Inner>,
}

impl TimetableService {
    /// Wraps `session` and starts the check loop if its user has reminders on.
    /// Must be called inside a tokio runtime.
    pub async fn start(
        session: Session,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<dyn AlertDispatcher>,
        config: RuntimeConfig,
    ) -> Self {
        let service = Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    session,
                    check_task: None,
                    alert_task: None,
                }),
                clock,
                dispatcher,
                config,
            }),
        };

        {
            let mut shared = service.inner.shared.lock().await;
            if shared.session.reminders_enabled() {
                service.start_check_loop(&mut shared);
            }
        }
        service
    }

    pub fn clock(&self) -> &dyn Clock {
        self.inner.clock.as_ref()
    }

    /// Exclusive access to the session for plain timetable operations.
    pub async fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner.shared.lock().await
    }

    pub async fn enable_reminders(&self) {
        let mut shared = self.inner.shared.lock().await;
        shared.session.set_reminders_enabled(true);
        info!("reminders enabled for {}", shared.session.identity().username);
        self.start_check_loop(&mut shared);
    }

    pub async fn disable_reminders(&self) {
        let mut shared = self.inner.shared.lock().await;
        shared.stop_check_loop();
        shared.stop_alert_loop();
        shared.session.set_reminders_enabled(false);
        self.inner.dispatcher.dismiss();
        info!("reminders disabled for {}", shared.session.identity().username);
    }

    pub async fn stop_alert(&self) -> Option<Alert> {
        let mut shared = self.inner.shared.lock().await;
        shared.stop_alert_loop();
        let stopped = shared.session.stop_alert();
        self.inner.dispatcher.dismiss();
        stopped
    }

    /// Loads another user's timetable. Credentials are checked and pending entries
    /// saved first; on failure the current user stays active with its tasks running.
    pub async fn switch_user(&self, username: &str, password: &str) -> Result<(), SessionError> {
        let mut shared = self.inner.shared.lock().await;
        let identity = shared.session.prepare_switch(username, password)?;

        shared.stop_check_loop();
        shared.stop_alert_loop();
        self.inner.dispatcher.dismiss();

        shared.session.switch_to(identity, self.inner.clock.now());
        if shared.session.reminders_enabled() {
            self.start_check_loop(&mut shared);
        }
        Ok(())
    }

    /// One reminder check, as run by the periodic loop.
    pub async fn tick(&self) {
        let mut shared = self.inner.shared.lock().await;
        self.tick_locked(&mut shared);
    }

    fn tick_locked(&self, shared: &mut Shared) {
        shared.session.poll_deferred_errors();
        let now = self.inner.clock.now();
        let fired = shared.session.check_reminders(now);
        for alert in &fired {
            self.inner.dispatcher.signal(alert);
        }
        if let Some(last) = fired.last() {
            self.start_alert_loop(shared, last.clone());
        }
    }

    fn start_check_loop(&self, shared: &mut Shared) {
        if shared.check_task.is_some() {
            return;
        }

        let service = self.clone();
        let period = self.inner.config.check_interval;
        shared.check_task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                service.tick().await;
            }
        }));
        debug!("reminder check loop started ({period:?})");
    }

    /// Replaces any running repeat with one for `alert`. The first signal was
    /// already sent by the tick that fired it.
    fn start_alert_loop(&self, shared: &mut Shared, alert: Alert) {
        shared.stop_alert_loop();

        let inner = self.inner.clone();
        let period = self.inner.config.alert_repeat;
        shared.alert_task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let shared = inner.shared.lock().await;
                if shared.session.active_alert().map(|a| &a.key) != Some(&alert.key) {
                    break;
                }
                inner.dispatcher.signal(&alert);
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::testing::RecordingDispatcher;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::timetable::{EventKind, NewEntry};
    use chrono::{NaiveDate, NaiveDateTime};
    use tokio::time::sleep;

    fn at(day: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, day)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    async fn service_at(
        now: NaiveDateTime,
        enabled: bool,
    ) -> (TimetableService, Arc<ManualClock>, Arc<RecordingDispatcher>) {
        let clock = Arc::new(ManualClock::new(now));
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let mut session = Session::open(Box::new(MemoryStore::new()), now);
        session
            .add_entry(NewEntry {
                day: "Monday".to_string(),
                subject: "Biology".to_string(),
                start: "09:00".to_string(),
                end: "10:00".to_string(),
                notes: None,
            })
            .unwrap();
        if enabled {
            session.set_reminders_enabled(true);
        }
        let service = TimetableService::start(
            session,
            clock.clone(),
            dispatcher.clone(),
            RuntimeConfig::default(),
        )
        .await;
        (service, clock, dispatcher)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_then_repeats_until_stopped() {
        let (service, _clock, dispatcher) = service_at(at(12, 9, 0, 30), true).await;

        sleep(Duration::from_millis(100)).await;
        assert_eq!(dispatcher.signal_count(), 1);

        // repeats at +2.4s and +4.8s; the 15s check does not refire
        sleep(Duration::from_millis(5_000)).await;
        assert_eq!(dispatcher.signal_count(), 3);
        sleep(Duration::from_secs(15)).await;
        let repeats = dispatcher.signal_count();
        assert!(repeats > 3);

        let stopped = service.stop_alert().await.unwrap();
        assert_eq!(stopped.kind, EventKind::Start);
        assert_eq!(dispatcher.dismiss_count(), 1);
        sleep(Duration::from_secs(30)).await;
        assert_eq!(dispatcher.signal_count(), repeats);

        let shared = service.lock().await;
        assert_eq!(shared.session.reminder_status(), "Reminders on");
        assert_eq!(shared.session.reminders().fired().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn end_event_fires_when_clock_reaches_it() {
        let (_service, clock, dispatcher) = service_at(at(12, 9, 30, 0), true).await;
        sleep(Duration::from_secs(20)).await;
        assert_eq!(dispatcher.signal_count(), 0);

        clock.set(at(12, 10, 1, 0));
        sleep(Duration::from_secs(15)).await;
        let signals = dispatcher.signals.lock().unwrap().clone();
        assert!(!signals.is_empty());
        assert!(signals.iter().all(|a| a.kind == EventKind::End));
        assert_eq!(signals[0].key.minute, 600);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_service_never_checks() {
        let (service, _clock, dispatcher) = service_at(at(12, 9, 0, 0), false).await;
        sleep(Duration::from_secs(60)).await;
        assert_eq!(dispatcher.signal_count(), 0);

        service.enable_reminders().await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(dispatcher.signal_count(), 1);

        service.disable_reminders().await;
        let after = dispatcher.signal_count();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(dispatcher.signal_count(), after);
        let shared = service.lock().await;
        assert_eq!(shared.session.reminder_status(), "Reminders off");
    }

    #[tokio::test(start_paused = true)]
    async fn switching_user_stops_tasks() {
        let (service, _clock, dispatcher) = service_at(at(12, 9, 0, 0), true).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(dispatcher.signal_count(), 1);

        assert!(service.switch_user("ada", "").await.is_err());
        sleep(Duration::from_millis(2_500)).await;
        assert_eq!(dispatcher.signal_count(), 2);

        service.switch_user("ada", "pw").await.unwrap();
        let after = dispatcher.signal_count();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(dispatcher.signal_count(), after);

        let shared = service.lock().await;
        assert_eq!(shared.session.identity().username, "ada");
        assert!(shared.session.entries().is_empty());
        assert!(shared.session.active_alert().is_none());
    }
}
