use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const DAY_NAMES: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Sun,
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
];

/// A weekly-recurring study session.
///
/// Fields are kept as the raw text that was stored. Entries persisted by older
/// builds (or edited by hand) may carry an unknown day, a malformed time, a `null`
/// or a number where text belongs; such entries are still listed, the scheduler
/// just skips the affected events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub day: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub subject: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub start: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub end: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub notes: String,
}

/// Any JSON value as text: `null` is empty, other scalars use their JSON spelling.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    End,
}

impl EventKind {
    pub const BOTH: [EventKind; 2] = [EventKind::Start, EventKind::End];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::End => "end",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EventKind::Start => "Start",
            EventKind::End => "End",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(EventKind::Start),
            "end" => Some(EventKind::End),
            _ => None,
        }
    }
}

impl Entry {
    pub fn weekday(&self) -> Option<Weekday> {
        weekday_from_name(&self.day)
    }

    pub fn time_of(&self, kind: EventKind) -> &str {
        match kind {
            EventKind::Start => &self.start,
            EventKind::End => &self.end,
        }
    }

    /// Minute-of-day for the start or end event, `None` when the stored time is malformed.
    pub fn minutes_of(&self, kind: EventKind) -> Option<u32> {
        time_to_minutes(self.time_of(kind))
    }
}

/// A user submission, validated into an [`Entry`] with a fresh id.
#[derive(Clone, Debug, Deserialize)]
pub struct NewEntry {
    pub day: String,
    pub subject: String,
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum EntryError {
    #[error("unknown day '{0}'")]
    InvalidDay(String),
    #[error("subject must not be empty")]
    EmptySubject,
    #[error("invalid start time '{0}', expected HH:MM")]
    InvalidStart(String),
    #[error("invalid end time '{0}', expected HH:MM")]
    InvalidEnd(String),
}

impl EntryError {
    pub fn code(&self) -> &'static str {
        match self {
            EntryError::InvalidDay(_) => "invalid_day",
            EntryError::EmptySubject => "empty_subject",
            EntryError::InvalidStart(_) => "invalid_start",
            EntryError::InvalidEnd(_) => "invalid_end",
        }
    }
}

impl NewEntry {
    pub fn into_entry(self) -> Result<Entry, EntryError> {
        let day = self.day.trim();
        if weekday_from_name(day).is_none() {
            return Err(EntryError::InvalidDay(self.day));
        }
        let subject = self.subject.trim();
        if subject.is_empty() {
            return Err(EntryError::EmptySubject);
        }
        let Some(start) = time_to_minutes(&self.start) else {
            return Err(EntryError::InvalidStart(self.start));
        };
        let Some(end) = time_to_minutes(&self.end) else {
            return Err(EntryError::InvalidEnd(self.end));
        };

        Ok(Entry {
            id: Uuid::new_v4().to_string(),
            day: day.to_string(),
            subject: subject.to_string(),
            start: fmt_minutes(start),
            end: fmt_minutes(end),
            notes: self.notes.as_deref().unwrap_or("").trim().to_string(),
        })
    }
}

/// Exact English weekday name to chrono's weekday. Abbreviations are not accepted.
pub fn weekday_from_name(name: &str) -> Option<Weekday> {
    DAY_NAMES
        .iter()
        .position(|d| *d == name)
        .map(|i| WEEKDAYS[i])
}

pub fn weekday_name(day: Weekday) -> &'static str {
    DAY_NAMES[day.num_days_from_sunday() as usize]
}

/// Parses `HH:MM` (24h) into minutes since midnight. A trailing `:SS` is ignored.
pub fn time_to_minutes(s: &str) -> Option<u32> {
    let mut parts = s.splitn(3, ':');
    let h: u32 = parts.next()?.trim().parse().ok()?;
    let m: u32 = parts.next()?.trim().parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

pub fn fmt_minutes(minutes: u32) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

pub fn minute_of_day(t: NaiveDateTime) -> u32 {
    t.hour() * 60 + t.minute()
}

/// `YYYY-MM-DD` of the local calendar date.
pub fn local_date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn weekday_of(t: NaiveDateTime) -> Weekday {
    t.date().weekday()
}

/// Table order: week order starting Sunday, then start time. Unknown days sink to the end.
pub fn sorted_for_display(entries: &[Entry]) -> Vec<Entry> {
    let mut out = entries.to_vec();
    out.sort_by(|a, b| {
        let da = a.weekday().map(|d| d.num_days_from_sunday()).unwrap_or(7);
        let db = b.weekday().map(|d| d.num_days_from_sunday()).unwrap_or(7);
        da.cmp(&db)
            .then_with(|| a.day.cmp(&b.day))
            .then_with(|| a.start.cmp(&b.start))
    });
    out
}

#[cfg(test)]
pub(crate) fn entry(id: &str, day: &str, start: &str, end: &str) -> Entry {
    Entry {
        id: id.to_string(),
        day: day.to_string(),
        subject: format!("Subject {id}"),
        start: start.to_string(),
        end: end.to_string(),
        notes: String::new(),
    }
}
