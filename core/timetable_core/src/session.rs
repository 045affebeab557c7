//! The active user's timetable, save state and reminder controller.

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::alert::Alert;
use crate::identity::{Identity, MissingPassword, UserKey};
use crate::projector::{next_occurrence, next_reminder_label, Occurrence};
use crate::reminder::{FiredEventSet, ReminderController, ReminderState};
use crate::store::{KeyValueStore, StoreError};
use crate::timetable::{sorted_for_display, Entry, EntryError, NewEntry};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveStatus {
    Saved,
    NotSaved,
    SaveFailed,
    StorageReset,
    PasswordRequired,
}

impl SaveStatus {
    pub fn message(self) -> &'static str {
        match self {
            SaveStatus::Saved => "All changes saved",
            SaveStatus::NotSaved => "Not saved",
            SaveStatus::SaveFailed => "Save failed",
            SaveStatus::StorageReset => "Storage data was reset",
            SaveStatus::PasswordRequired => "Enter password to load user",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("enter password to load user")]
    PasswordRequired,
    #[error("save failed: {0}")]
    SaveFailed(#[from] StoreError),
}

impl From<MissingPassword> for SessionError {
    fn from(_: MissingPassword) -> Self {
        SessionError::PasswordRequired
    }
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::PasswordRequired => "password_required",
            SessionError::SaveFailed(_) => "save_failed",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionStatus {
    pub username: String,
    pub user_label: String,
    pub saved: bool,
    pub save_status: SaveStatus,
    pub save_message: &'static str,
    pub reminders_enabled: bool,
    pub reminder_status: String,
    pub next_reminder: String,
    pub entry_count: usize,
}

pub struct Session {
    store: Box<dyn KeyValueStore>,
    identity: Identity,
    entries: Vec<Entry>,
    saved: bool,
    save_status: SaveStatus,
    reminders: ReminderController,
}

impl Session {
    /// Opens whichever user was active last time (the guest on first run).
    pub fn open(mut store: Box<dyn KeyValueStore>, now: NaiveDateTime) -> Self {
        let identity = Identity::load_current(store.as_mut());
        let mut session = Self {
            store,
            identity,
            entries: Vec::new(),
            saved: true,
            save_status: SaveStatus::Saved,
            reminders: ReminderController::new(false, FiredEventSet::new()),
        };
        session.load_user_data(now.date());
        session
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn sorted_entries(&self) -> Vec<Entry> {
        sorted_for_display(&self.entries)
    }

    pub fn is_saved(&self) -> bool {
        self.saved
    }

    pub fn save_status(&self) -> SaveStatus {
        self.save_status
    }

    pub fn reminders(&self) -> &ReminderController {
        &self.reminders
    }

    pub fn reminders_enabled(&self) -> bool {
        self.reminders.is_enabled()
    }

    pub fn active_alert(&self) -> Option<&Alert> {
        self.reminders.active_alert()
    }

    pub fn reminder_status(&self) -> String {
        match self.reminders.state() {
            ReminderState::Disabled => "Reminders off".to_string(),
            ReminderState::Idle => "Reminders on".to_string(),
            ReminderState::Alerting(alert) => alert.status_message(),
        }
    }

    pub fn next_occurrence(&self, now: NaiveDateTime) -> Option<Occurrence> {
        next_occurrence(&self.entries, now)
    }

    pub fn status(&mut self, now: NaiveDateTime) -> SessionStatus {
        self.poll_deferred_errors();
        SessionStatus {
            username: self.identity.username.clone(),
            user_label: format!("User: {}", self.identity.username),
            saved: self.saved,
            save_status: self.save_status,
            save_message: self.save_status.message(),
            reminders_enabled: self.reminders.is_enabled(),
            reminder_status: self.reminder_status(),
            next_reminder: next_reminder_label(self.next_occurrence(now).as_ref()),
            entry_count: self.entries.len(),
        }
    }

    /// Picks up failures of background writes and reflects them in the save status.
    pub fn poll_deferred_errors(&mut self) {
        if let Some(err) = self.store.take_deferred_error() {
            error!("background save failed: {err}");
            self.saved = false;
            self.save_status = SaveStatus::SaveFailed;
        }
    }

    pub fn add_entry(&mut self, new: NewEntry) -> Result<Entry, EntryError> {
        let entry = new.into_entry()?;
        self.entries.push(entry.clone());
        self.mark_unsaved();
        Ok(entry)
    }

    pub fn remove_entry(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        let removed = self.entries.len() != before;
        if removed {
            self.mark_unsaved();
        }
        removed
    }

    pub fn clear_entries(&mut self) {
        self.entries.clear();
        self.mark_unsaved();
    }

    fn mark_unsaved(&mut self) {
        self.saved = false;
        self.save_status = SaveStatus::NotSaved;
    }

    /// Writes the entries. On failure the in-memory entries stay, still marked unsaved.
    pub fn save_entries(&mut self) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&self.entries).unwrap_or_else(|_| "[]".to_string());
        let key = self.identity.storage_key(UserKey::Entries);
        if let Err(err) = self.store.set(&key, &raw) {
            error!("saving entries failed: {err}");
            self.save_status = SaveStatus::SaveFailed;
            return Err(err);
        }
        self.saved = true;
        self.save_status = SaveStatus::Saved;
        Ok(())
    }

    /// Saves unsaved entries ahead of a user switch.
    pub fn save_pending(&mut self) -> Result<(), SessionError> {
        if !self.saved {
            self.save_entries()?;
        }
        Ok(())
    }

    /// Validates credentials and saves pending changes without touching the active user.
    pub fn prepare_switch(&mut self, username: &str, password: &str) -> Result<Identity, SessionError> {
        self.poll_deferred_errors();
        let identity = match Identity::from_credentials(username, password) {
            Ok(id) => id,
            Err(err) => {
                self.save_status = SaveStatus::PasswordRequired;
                return Err(err.into());
            }
        };
        self.save_pending()?;
        Ok(identity)
    }

    /// Replaces all per-user state with `identity`'s. Reminder tasks must already be stopped.
    pub fn switch_to(&mut self, identity: Identity, now: NaiveDateTime) {
        info!("switching user to {}", identity.username);
        self.identity = identity;
        if let Err(err) = self.identity.persist_current(self.store.as_mut()) {
            warn!("recording current session failed: {err}");
        }
        self.load_user_data(now.date());
    }

    pub fn switch_user(&mut self, username: &str, password: &str, now: NaiveDateTime) -> Result<(), SessionError> {
        let identity = self.prepare_switch(username, password)?;
        self.switch_to(identity, now);
        Ok(())
    }

    fn load_user_data(&mut self, today: NaiveDate) {
        self.load_reminder_state(today);
        self.load_entries();
    }

    fn load_reminder_state(&mut self, today: NaiveDate) {
        let enabled = self
            .read(UserKey::RemindersEnabled)
            .is_some_and(|v| v == "true");
        let fired = FiredEventSet::load(self.read(UserKey::ReminderFiredEvents).as_deref());
        self.reminders = ReminderController::new(enabled, fired);
        if let Err(err) = self.persist_fired(today) {
            warn!("rewriting fired reminders failed: {err}");
        }
    }

    fn load_entries(&mut self) {
        self.entries.clear();
        self.saved = true;
        self.save_status = SaveStatus::Saved;

        let Some(raw) = self.read(UserKey::Entries) else {
            return;
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(items)) => {
                let total = items.len();
                self.entries = items
                    .into_iter()
                    .filter(Value::is_object)
                    .filter_map(|item| serde_json::from_value::<Entry>(item).ok())
                    .collect();
                if self.entries.len() < total {
                    warn!("skipped {} stored entries that are not objects", total - self.entries.len());
                }
            }
            Ok(_) => {
                warn!("stored entries are not a list, starting empty");
            }
            Err(err) => {
                warn!("stored entries unreadable, resetting: {err}");
                let key = self.identity.storage_key(UserKey::Entries);
                if let Err(err) = self.store.remove(&key) {
                    warn!("removing unreadable entries failed: {err}");
                }
                self.save_status = SaveStatus::StorageReset;
            }
        }
    }

    fn read(&mut self, key: UserKey) -> Option<String> {
        let key = self.identity.storage_key(key);
        match self.store.get(&key) {
            Ok(v) => v,
            Err(err) => {
                warn!("reading {key} failed: {err}");
                None
            }
        }
    }

    pub fn set_reminders_enabled(&mut self, enabled: bool) -> Option<Alert> {
        let key = self.identity.storage_key(UserKey::RemindersEnabled);
        if let Err(err) = self.store.set(&key, if enabled { "true" } else { "false" }) {
            warn!("saving reminder setting failed: {err}");
        }
        if enabled {
            self.reminders.enable();
            None
        } else {
            self.reminders.disable()
        }
    }

    pub fn stop_alert(&mut self) -> Option<Alert> {
        self.reminders.stop_alert()
    }

    /// Runs one reminder check; newly fired keys are persisted before being returned.
    pub fn check_reminders(&mut self, now: NaiveDateTime) -> Vec<Alert> {
        let fired = self.reminders.check_reminders(&self.entries, now);
        if !fired.is_empty() {
            if let Err(err) = self.persist_fired(now.date()) {
                error!("saving fired reminders failed: {err}");
                self.save_status = SaveStatus::SaveFailed;
            }
        }
        fired
    }

    fn persist_fired(&mut self, today: NaiveDate) -> Result<(), StoreError> {
        self.reminders.fired_mut().prune(today);
        let raw = self.reminders.fired().to_json();
        let key = self.identity.storage_key(UserKey::ReminderFiredEvents);
        self.store.set(&key, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::CURRENT_SESSION_KEY;
    use crate::reminder::ReminderKey;
    use crate::store::MemoryStore;
    use crate::timetable::EventKind;

    /// Shares one in-memory map between sessions, like a store reopened after reload.
    #[derive(Clone, Default)]
    struct SharedStore(std::sync::Arc<std::sync::Mutex<MemoryStore>>);

    impl KeyValueStore for SharedStore {
        fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
            self.0.lock().unwrap().get(key)
        }
        fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
            self.0.lock().unwrap().set(key, value)
        }
        fn remove(&mut self, key: &str) -> Result<(), StoreError> {
            self.0.lock().unwrap().remove(key)
        }
    }

    impl SharedStore {
        fn raw(&self, key: &str) -> Option<String> {
            self.0.lock().unwrap().get(key).unwrap()
        }
        fn put(&self, key: &str, value: &str) {
            self.0.lock().unwrap().set(key, value).unwrap();
        }
        fn fail_writes(&self, fail: bool) {
            self.0.lock().unwrap().fail_writes(fail);
        }
    }

    /// Accepts every write but, while `failing` is set, drops it and reports the
    /// failure later through `take_deferred_error`, like the remote writer.
    struct WriteBehindStore {
        shared: SharedStore,
        failing: std::sync::Arc<std::sync::atomic::AtomicBool>,
        pending: Option<StoreError>,
    }

    impl WriteBehindStore {
        fn is_failing(&self) -> bool {
            self.failing.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl KeyValueStore for WriteBehindStore {
        fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
            self.shared.get(key)
        }
        fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
            if self.is_failing() {
                self.pending = Some(StoreError::RemoteStatus(503));
                return Ok(());
            }
            self.shared.set(key, value)
        }
        fn remove(&mut self, key: &str) -> Result<(), StoreError> {
            if self.is_failing() {
                self.pending = Some(StoreError::RemoteStatus(503));
                return Ok(());
            }
            self.shared.remove(key)
        }
        fn take_deferred_error(&mut self) -> Option<StoreError> {
            self.pending.take()
        }
    }

    fn write_behind(
        shared: &SharedStore,
    ) -> (Box<WriteBehindStore>, std::sync::Arc<std::sync::atomic::AtomicBool>) {
        let failing = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let store = Box::new(WriteBehindStore {
            shared: shared.clone(),
            failing: failing.clone(),
            pending: None,
        });
        (store, failing)
    }

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn monday_new() -> NewEntry {
        NewEntry {
            day: "Monday".to_string(),
            subject: "Physics".to_string(),
            start: "09:00".to_string(),
            end: "10:00".to_string(),
            notes: Some("lab".to_string()),
        }
    }

    fn guest_key(key: UserKey) -> String {
        Identity::guest().storage_key(key)
    }

    #[test]
    fn first_open_is_guest_with_nothing() {
        let store = SharedStore::default();
        let mut s = Session::open(Box::new(store.clone()), at(12, 8, 0));
        assert_eq!(s.identity(), &Identity::guest());
        assert!(s.entries().is_empty());
        assert!(!s.reminders_enabled());
        let st = s.status(at(12, 8, 0));
        assert_eq!(st.user_label, "User: guest");
        assert_eq!(st.save_message, "All changes saved");
        assert_eq!(st.reminder_status, "Reminders off");
        assert_eq!(st.next_reminder, "No upcoming reminders");
        assert!(store.raw(CURRENT_SESSION_KEY).is_some());
    }

    #[test]
    fn entries_survive_reopen_only_after_save() {
        let store = SharedStore::default();
        let mut s = Session::open(Box::new(store.clone()), at(12, 8, 0));
        s.add_entry(monday_new()).unwrap();
        assert!(!s.is_saved());
        assert_eq!(s.save_status(), SaveStatus::NotSaved);

        let reopened = Session::open(Box::new(store.clone()), at(12, 8, 0));
        assert!(reopened.entries().is_empty());

        s.save_entries().unwrap();
        assert!(s.is_saved());
        let reopened = Session::open(Box::new(store.clone()), at(12, 8, 0));
        assert_eq!(reopened.entries(), s.entries());
    }

    #[test]
    fn failed_save_keeps_entries_in_memory() {
        let store = SharedStore::default();
        let mut s = Session::open(Box::new(store.clone()), at(12, 8, 0));
        s.add_entry(monday_new()).unwrap();
        store.fail_writes(true);
        assert!(s.save_entries().is_err());
        assert_eq!(s.save_status(), SaveStatus::SaveFailed);
        assert_eq!(s.entries().len(), 1);
        assert!(!s.is_saved());

        store.fail_writes(false);
        s.save_entries().unwrap();
        assert_eq!(s.save_status(), SaveStatus::Saved);
    }

    #[test]
    fn corrupt_entries_are_reset() {
        let store = SharedStore::default();
        store.put(&guest_key(UserKey::Entries), "{not json");
        let s = Session::open(Box::new(store.clone()), at(12, 8, 0));
        assert!(s.entries().is_empty());
        assert_eq!(s.save_status(), SaveStatus::StorageReset);
        assert_eq!(store.raw(&guest_key(UserKey::Entries)), None);
    }

    #[test]
    fn malformed_entries_are_kept_and_only_non_objects_dropped() {
        let store = SharedStore::default();
        store.put(
            &guest_key(UserKey::Entries),
            r#"[{"id":"a","day":"Monday","subject":"A","start":"09:00","end":"10:00"},
                {"id":"b"},
                42,
                "junk",
                {"id":"c","day":"Someday","subject":"C","start":"xx","end":"10:00","notes":"n"}]"#,
        );
        let s = Session::open(Box::new(store.clone()), at(12, 8, 0));
        let ids: Vec<_> = s.entries().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(s.save_status(), SaveStatus::Saved);
    }

    #[test]
    fn entries_with_null_fields_survive_a_save() {
        let store = SharedStore::default();
        let key = guest_key(UserKey::Entries);
        store.put(
            &key,
            r#"[{"id":"a","day":"Monday","subject":"A","start":"09:00","end":"10:00","notes":null},
                {"id":"b","day":"Monday","subject":"B","start":null,"end":"11:00"}]"#,
        );
        let mut s = Session::open(Box::new(store.clone()), at(12, 8, 0));
        assert_eq!(s.entries().len(), 2);

        // b has no start event, only its end is scheduled
        let next = s.next_occurrence(at(12, 10, 30)).unwrap();
        assert_eq!((next.entry.id.as_str(), next.kind), ("b", EventKind::End));

        s.add_entry(monday_new()).unwrap();
        s.save_entries().unwrap();
        let reopened = Session::open(Box::new(store.clone()), at(12, 8, 0));
        let ids: Vec<_> = reopened.entries().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids[..2].to_vec(), vec!["a", "b"]);
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn remove_and_clear_mark_unsaved() {
        let store = SharedStore::default();
        let mut s = Session::open(Box::new(store), at(12, 8, 0));
        let e = s.add_entry(monday_new()).unwrap();
        s.save_entries().unwrap();
        assert!(!s.remove_entry("nope"));
        assert!(s.is_saved());
        assert!(s.remove_entry(&e.id));
        assert!(!s.is_saved());
        s.save_entries().unwrap();
        s.clear_entries();
        assert!(!s.is_saved());
    }

    #[test]
    fn fired_reminders_persist_across_reopen() {
        let store = SharedStore::default();
        let mut s = Session::open(Box::new(store.clone()), at(12, 8, 0));
        s.add_entry(monday_new()).unwrap();
        s.save_entries().unwrap();
        s.set_reminders_enabled(true);

        let fired = s.check_reminders(at(12, 9, 1));
        assert_eq!(fired.len(), 1);
        assert_eq!(s.reminder_status(), "Start reminder active: Physics (09:00 - 10:00)");

        let mut reopened = Session::open(Box::new(store.clone()), at(12, 9, 1));
        assert!(reopened.reminders_enabled());
        assert!(reopened.check_reminders(at(12, 9, 2)).is_empty());
    }

    #[test]
    fn stale_fired_keys_are_pruned_on_load_and_write() {
        let store = SharedStore::default();
        let fired_key = guest_key(UserKey::ReminderFiredEvents);
        store.put(&fired_key, r#"["2026-09-01:old:start:540","2026-10-10:recent:end:600"]"#);

        let mut s = Session::open(Box::new(store.clone()), at(12, 8, 0));
        let raw = store.raw(&fired_key).unwrap();
        assert!(!raw.contains("2026-09-01"));
        assert!(raw.contains("2026-10-10"));
        assert_eq!(s.reminders().fired().len(), 1);

        // fourteen days later the recent one goes too, on the next write
        s.add_entry(monday_new()).unwrap();
        s.set_reminders_enabled(true);
        assert_eq!(s.check_reminders(at(26, 9, 0)).len(), 1);
        let raw = store.raw(&fired_key).unwrap();
        assert!(!raw.contains("2026-10-10"));
        assert!(s.reminders().fired().contains(&ReminderKey {
            date: NaiveDate::from_ymd_opt(2026, 10, 26).unwrap(),
            entry_id: s.entries()[0].id.clone(),
            kind: EventKind::Start,
            minute: 540,
        }));
    }

    #[test]
    fn fired_write_failure_is_reported_but_dedup_holds() {
        let store = SharedStore::default();
        let mut s = Session::open(Box::new(store.clone()), at(12, 8, 0));
        s.add_entry(monday_new()).unwrap();
        s.set_reminders_enabled(true);
        store.fail_writes(true);
        assert_eq!(s.check_reminders(at(12, 9, 0)).len(), 1);
        assert_eq!(s.save_status(), SaveStatus::SaveFailed);
        assert!(s.check_reminders(at(12, 9, 1)).is_empty());
    }

    #[test]
    fn switching_requires_password_and_isolates_users() {
        let store = SharedStore::default();
        let mut s = Session::open(Box::new(store.clone()), at(12, 8, 0));
        s.add_entry(monday_new()).unwrap();
        s.set_reminders_enabled(true);

        let err = s.switch_user("ada", "   ", at(12, 8, 0)).unwrap_err();
        assert_eq!(err.code(), "password_required");
        assert_eq!(s.save_status(), SaveStatus::PasswordRequired);
        assert_eq!(s.identity(), &Identity::guest());

        // pending guest entries are saved on the way out
        s.switch_user("Ada", "pw", at(12, 8, 0)).unwrap();
        assert_eq!(s.identity().username, "Ada");
        assert!(s.entries().is_empty());
        assert!(!s.reminders_enabled());
        assert!(store.raw(&guest_key(UserKey::Entries)).is_some());

        s.switch_user("guest", "guest", at(12, 8, 0)).unwrap();
        assert_eq!(s.entries().len(), 1);
        assert!(s.reminders_enabled());

        let reopened = Session::open(Box::new(store), at(12, 8, 0));
        assert_eq!(reopened.identity(), &Identity::guest());
    }

    #[test]
    fn switch_aborts_when_pending_save_fails() {
        let store = SharedStore::default();
        let mut s = Session::open(Box::new(store.clone()), at(12, 8, 0));
        s.add_entry(monday_new()).unwrap();
        store.fail_writes(true);
        let err = s.switch_user("ada", "pw", at(12, 8, 0)).unwrap_err();
        assert_eq!(err.code(), "save_failed");
        assert_eq!(s.identity(), &Identity::guest());
        assert_eq!(s.entries().len(), 1);
    }

    #[test]
    fn background_save_failure_marks_entries_unsaved() {
        let shared = SharedStore::default();
        let (store, failing) = write_behind(&shared);
        let mut s = Session::open(store, at(12, 8, 0));
        s.add_entry(monday_new()).unwrap();

        failing.store(true, std::sync::atomic::Ordering::SeqCst);
        s.save_entries().unwrap();
        assert!(s.is_saved());

        let st = s.status(at(12, 8, 0));
        assert!(!st.saved);
        assert_eq!(st.save_status, SaveStatus::SaveFailed);
        assert_eq!(st.save_message, "Save failed");
        assert_eq!(s.entries().len(), 1);
    }

    #[test]
    fn switch_resaves_entries_whose_background_write_failed() {
        let shared = SharedStore::default();
        let (store, failing) = write_behind(&shared);
        let mut s = Session::open(store, at(12, 8, 0));
        s.add_entry(monday_new()).unwrap();

        failing.store(true, std::sync::atomic::Ordering::SeqCst);
        s.save_entries().unwrap();
        failing.store(false, std::sync::atomic::Ordering::SeqCst);

        // the failure has not been observed yet; the switch must pick it up
        s.switch_user("ada", "pw", at(12, 8, 0)).unwrap();
        assert_eq!(s.identity().username, "ada");
        let saved = shared.raw(&guest_key(UserKey::Entries)).unwrap();
        assert!(saved.contains("Physics"));
    }
}
