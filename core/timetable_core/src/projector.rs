//! Projection of weekly-recurring entries onto concrete future instants.

use chrono::{Duration, NaiveDateTime, NaiveTime};
use serde::Serialize;

use crate::timetable::{fmt_minutes, minute_of_day, weekday_name, weekday_of, Entry, EventKind};

/// The soonest upcoming start or end event across a timetable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Occurrence {
    pub entry: Entry,
    pub kind: EventKind,
    pub when: NaiveDateTime,
}

impl Occurrence {
    pub fn label(&self) -> String {
        format!(
            "Next: {} {} ({} {})",
            self.kind.label(),
            self.entry.subject,
            weekday_name(weekday_of(self.when)),
            fmt_minutes(minute_of_day(self.when)),
        )
    }
}

pub const NO_UPCOMING_LABEL: &str = "No upcoming reminders";

pub fn next_reminder_label(next: Option<&Occurrence>) -> String {
    next.map(Occurrence::label)
        .unwrap_or_else(|| NO_UPCOMING_LABEL.to_string())
}

/// Next instant strictly after `now` at which `entry`'s `kind` event happens.
pub fn project(entry: &Entry, kind: EventKind, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let target = entry.weekday()?.num_days_from_sunday() as i64;
    let minutes = entry.minutes_of(kind)?;
    let today = weekday_of(now).num_days_from_sunday() as i64;
    let days_until = (target - today + 7) % 7;

    let time = NaiveTime::from_num_seconds_from_midnight_opt(minutes * 60, 0)?;
    let candidate = (now.date() + Duration::days(days_until)).and_time(time);
    if candidate <= now {
        return Some(candidate + Duration::days(7));
    }
    Some(candidate)
}

/// Soonest occurrence over all entries, or `None` when nothing is schedulable.
///
/// Equal instants resolve to the lowest entry id, then start before end, so the
/// answer does not depend on the order entries were added in.
pub fn next_occurrence(entries: &[Entry], now: NaiveDateTime) -> Option<Occurrence> {
    let mut best: Option<(NaiveDateTime, &str, EventKind, &Entry)> = None;

    for entry in entries {
        for kind in EventKind::BOTH {
            let Some(when) = project(entry, kind, now) else {
                continue;
            };
            let candidate = (when, entry.id.as_str(), kind, entry);
            let better = match &best {
                None => true,
                Some((w, id, k, _)) => (when, entry.id.as_str(), kind) < (*w, *id, *k),
            };
            if better {
                best = Some(candidate);
            }
        }
    }

    best.map(|(when, _, kind, entry)| Occurrence {
        entry: entry.clone(),
        kind,
        when,
    })
}
