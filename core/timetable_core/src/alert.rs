use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{debug, info};

use crate::reminder::ReminderKey;
use crate::timetable::{Entry, EventKind};

/// A fired reminder for one concrete occurrence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub key: ReminderKey,
    pub entry: Entry,
    pub kind: EventKind,
    pub fired_at: NaiveDateTime,
}

impl Alert {
    pub fn status_message(&self) -> String {
        format!(
            "{} reminder active: {} ({} - {})",
            self.kind.label(),
            self.entry.subject,
            self.entry.start,
            self.entry.end
        )
    }

    pub fn notification_title(&self) -> String {
        format!("Study reminder: {}", self.entry.subject)
    }

    pub fn notification_body(&self) -> String {
        format!(
            "{} now ({} {} - {})",
            self.kind.label(),
            self.entry.day,
            self.entry.start,
            self.entry.end
        )
    }
}

/// Delivery side of reminders. Calls are fire-and-forget.
pub trait AlertDispatcher: Send + Sync {
    /// Called once when an alert fires, then again on every repeat while it stays active.
    fn signal(&self, alert: &Alert);

    /// The alert was acknowledged or reminders were turned off.
    fn dismiss(&self) {}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActiveAlert {
    /// Increments for every distinct alert, so pollers can tell a new alert from a repeat.
    pub sequence: u64,
    pub signals: u64,
    pub title: String,
    pub body: String,
    pub alert: Alert,
}

/// Holds the current alert for the HTTP API, which the desktop notifier polls.
pub struct AlertBoard {
    current: Mutex<Option<ActiveAlert>>,
    sequence: AtomicU64,
}

impl Default for AlertBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertBoard {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> Option<ActiveAlert> {
        self.slot().clone()
    }

    fn slot(&self) -> MutexGuard<'_, Option<ActiveAlert>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AlertDispatcher for AlertBoard {
    fn signal(&self, alert: &Alert) {
        let mut slot = self.slot();
        if let Some(active) = slot.as_mut().filter(|a| a.alert.key == alert.key) {
            active.signals += 1;
            debug!("reminder repeat #{}: {}", active.signals, active.title);
            return;
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        info!("{}", alert.status_message());
        *slot = Some(ActiveAlert {
            sequence,
            signals: 1,
            title: alert.notification_title(),
            body: alert.notification_body(),
            alert: alert.clone(),
        });
    }

    fn dismiss(&self) {
        if self.slot().take().is_some() {
            info!("reminder alert dismissed");
        }
    }
}
