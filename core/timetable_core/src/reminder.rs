//! Reminder firing: the enable/alert state machine and the fired-event dedup set.

use std::collections::HashSet;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::alert::Alert;
use crate::timetable::{minute_of_day, weekday_name, weekday_of, Entry, EventKind};

/// An event stays fireable from its exact minute through this many minutes after.
pub const GRACE_MINUTES: u32 = 2;
/// Fired keys older than this many days before today are dropped on every write.
pub const RETENTION_DAYS: i64 = 14;

/// Identity of one concrete occurrence: the dedup unit for alerts.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReminderKey {
    pub date: NaiveDate,
    pub entry_id: String,
    pub kind: EventKind,
    pub minute: u32,
}

impl ReminderKey {
    /// Reads the `{date}:{entry_id}:{kind}:{minute}` form written by older builds.
    ///
    /// Kind and minute are taken from the right and the date from the left, so an
    /// entry id containing `:` still round-trips.
    pub fn parse_legacy(s: &str) -> Option<Self> {
        let (date, rest) = s.split_once(':')?;
        let (rest, minute) = rest.rsplit_once(':')?;
        let (entry_id, kind) = rest.rsplit_once(':')?;
        if entry_id.is_empty() {
            return None;
        }
        Some(ReminderKey {
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?,
            entry_id: entry_id.to_string(),
            kind: EventKind::parse(kind)?,
            minute: minute.parse().ok()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FiredEventSet {
    keys: HashSet<ReminderKey>,
}

impl FiredEventSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &ReminderKey) -> bool {
        self.keys.contains(key)
    }

    /// Returns `false` when the key was already present.
    pub fn insert(&mut self, key: ReminderKey) -> bool {
        self.keys.insert(key)
    }

    /// Drops keys dated before `today - RETENTION_DAYS`.
    pub fn prune(&mut self, today: NaiveDate) -> usize {
        let cutoff = today - Duration::days(RETENTION_DAYS);
        let before = self.keys.len();
        self.keys.retain(|k| k.date >= cutoff);
        before - self.keys.len()
    }

    /// Parses the stored form. A value that is not a JSON array is an error; items
    /// inside the array that are not keys are dropped.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let items: Vec<Value> = serde_json::from_str(raw)?;
        let total = items.len();
        let keys: HashSet<ReminderKey> = items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => ReminderKey::parse_legacy(&s),
                other => serde_json::from_value(other).ok(),
            })
            .collect();
        if keys.len() < total {
            debug!("dropped {} unreadable fired reminder keys", total - keys.len());
        }
        Ok(Self { keys })
    }

    /// Stored form, sorted so equal sets serialize identically.
    pub fn to_json(&self) -> String {
        let mut keys: Vec<&ReminderKey> = self.keys.iter().collect();
        keys.sort();
        serde_json::to_string(&keys).unwrap_or_else(|_| "[]".to_string())
    }

    /// Lenient load used when a user's state is opened: missing or malformed data is empty.
    pub fn load(raw: Option<&str>) -> Self {
        match raw {
            None => Self::new(),
            Some(raw) => Self::from_json(raw).unwrap_or_else(|err| {
                warn!("fired reminder set unreadable, starting empty: {err}");
                Self::new()
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReminderState {
    Disabled,
    Idle,
    Alerting(Alert),
}

impl ReminderState {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, ReminderState::Disabled)
    }
}

/// Decides which occurring events fire, exactly once per [`ReminderKey`].
///
/// The controller is pure state: persisting the fired set and delivering alerts is
/// left to the caller, which receives the newly fired alerts from
/// [`check_reminders`](Self::check_reminders).
#[derive(Debug)]
pub struct ReminderController {
    state: ReminderState,
    fired: FiredEventSet,
}

impl ReminderController {
    pub fn new(enabled: bool, fired: FiredEventSet) -> Self {
        Self {
            state: if enabled {
                ReminderState::Idle
            } else {
                ReminderState::Disabled
            },
            fired,
        }
    }

    pub fn state(&self) -> &ReminderState {
        &self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_enabled()
    }

    pub fn active_alert(&self) -> Option<&Alert> {
        match &self.state {
            ReminderState::Alerting(alert) => Some(alert),
            _ => None,
        }
    }

    pub fn fired(&self) -> &FiredEventSet {
        &self.fired
    }

    pub fn fired_mut(&mut self) -> &mut FiredEventSet {
        &mut self.fired
    }

    /// `Disabled -> Idle`. Returns `false` if reminders were already on.
    pub fn enable(&mut self) -> bool {
        if self.state.is_enabled() {
            return false;
        }
        self.state = ReminderState::Idle;
        true
    }

    /// `* -> Disabled`, returning the alert that was active, if any.
    pub fn disable(&mut self) -> Option<Alert> {
        match std::mem::replace(&mut self.state, ReminderState::Disabled) {
            ReminderState::Alerting(alert) => Some(alert),
            _ => None,
        }
    }

    /// `Alerting -> Idle`. No-op in other states.
    pub fn stop_alert(&mut self) -> Option<Alert> {
        if !matches!(self.state, ReminderState::Alerting(_)) {
            return None;
        }
        match std::mem::replace(&mut self.state, ReminderState::Idle) {
            ReminderState::Alerting(alert) => Some(alert),
            _ => None,
        }
    }

    /// One tick of the reminder loop.
    ///
    /// Every entry scheduled for today's weekday has its start and end checked
    /// against the firing window. Each newly fired key is recorded in the fired set
    /// and the controller moves to `Alerting` for the last one; the returned alerts
    /// are the ones the caller must persist and dispatch.
    pub fn check_reminders(&mut self, entries: &[Entry], now: NaiveDateTime) -> Vec<Alert> {
        if !self.state.is_enabled() || entries.is_empty() {
            return Vec::new();
        }

        let today = now.date();
        let day_name = weekday_name(weekday_of(now));
        let now_minutes = minute_of_day(now);

        let mut fired = Vec::new();
        for entry in entries.iter().filter(|e| e.day == day_name) {
            for kind in EventKind::BOTH {
                if let Some(alert) =
                    self.maybe_trigger(entry, kind, entry.minutes_of(kind), now_minutes, today, now)
                {
                    fired.push(alert);
                }
            }
        }

        if let Some(last) = fired.last() {
            self.state = ReminderState::Alerting(last.clone());
        }
        fired
    }

    fn maybe_trigger(
        &mut self,
        entry: &Entry,
        kind: EventKind,
        event_minutes: Option<u32>,
        now_minutes: u32,
        date: NaiveDate,
        now: NaiveDateTime,
    ) -> Option<Alert> {
        let event_minutes = event_minutes?;
        if now_minutes < event_minutes || now_minutes > event_minutes + GRACE_MINUTES {
            return None;
        }

        let key = ReminderKey {
            date,
            entry_id: entry.id.clone(),
            kind,
            minute: event_minutes,
        };
        if !self.fired.insert(key.clone()) {
            return None;
        }

        Some(Alert {
            key,
            entry: entry.clone(),
            kind,
            fired_at: now,
        })
    }
}
