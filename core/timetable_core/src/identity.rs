//! Who the timetable belongs to, and how their data is namespaced in storage.
//!
//! The credential hash is a scoping token, not authentication: a different
//! password for the same username simply opens a different, empty timetable.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::{KeyValueStore, StoreError};

pub const CURRENT_SESSION_KEY: &str = "timetableCurrentSession";
pub const DEFAULT_USERNAME: &str = "guest";
pub const DEFAULT_PASSWORD: &str = "guest";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserKey {
    Entries,
    RemindersEnabled,
    ReminderFiredEvents,
}

impl UserKey {
    fn suffix(self) -> &'static str {
        match self {
            UserKey::Entries => "entries",
            UserKey::RemindersEnabled => "remindersEnabled",
            UserKey::ReminderFiredEvents => "reminderFiredEvents",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    #[serde(rename = "passwordHash")]
    pub password_hash: String,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("password required")]
pub struct MissingPassword;

/// Trims and collapses inner whitespace; blank names become the guest user.
pub fn normalize_username(raw: &str) -> String {
    let cleaned = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        DEFAULT_USERNAME.to_string()
    } else {
        cleaned
    }
}

pub fn normalize_password(raw: &str) -> String {
    raw.trim().to_string()
}

/// 32-bit FNV-style hash of `lowercase(username)::password`, rendered in base 36.
pub fn hash_credential(username: &str, password: &str) -> String {
    let source = format!("{}::{}", normalize_username(username).to_lowercase(), password);
    let mut hash: u32 = 2_166_136_261;
    for unit in source.encode_utf16() {
        hash ^= u32::from(unit);
        hash = hash
            .wrapping_add(hash << 1)
            .wrapping_add(hash << 4)
            .wrapping_add(hash << 7)
            .wrapping_add(hash << 8)
            .wrapping_add(hash << 24);
    }
    to_base36(hash)
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

impl Identity {
    pub fn guest() -> Self {
        Self {
            username: DEFAULT_USERNAME.to_string(),
            password_hash: hash_credential(DEFAULT_USERNAME, DEFAULT_PASSWORD),
        }
    }

    pub fn from_credentials(username: &str, password: &str) -> Result<Self, MissingPassword> {
        let username = normalize_username(username);
        let password = normalize_password(password);
        if password.is_empty() {
            return Err(MissingPassword);
        }
        Ok(Self {
            password_hash: hash_credential(&username, &password),
            username,
        })
    }

    pub fn storage_key(&self, key: UserKey) -> String {
        let user = urlencoding::encode(&normalize_username(&self.username).to_lowercase()).into_owned();
        format!("timetable:{user}:{}:{}", self.password_hash, key.suffix())
    }

    /// The identity that was active last time, falling back to (and recording) the guest.
    pub fn load_current(store: &mut dyn KeyValueStore) -> Self {
        let stored = match store.get(CURRENT_SESSION_KEY) {
            Ok(v) => v,
            Err(err) => {
                warn!("reading current session failed: {err}");
                None
            }
        };

        let parsed = stored
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Identity>(raw).ok())
            .filter(|id| !id.password_hash.is_empty());

        match parsed {
            Some(id) => Self {
                username: normalize_username(&id.username),
                password_hash: id.password_hash,
            },
            None => {
                if stored.is_some() {
                    warn!("current session record unreadable, falling back to guest");
                }
                let guest = Self::guest();
                if let Err(err) = guest.persist_current(store) {
                    warn!("recording guest session failed: {err}");
                }
                guest
            }
        }
    }

    pub fn persist_current(&self, store: &mut dyn KeyValueStore) -> Result<(), StoreError> {
        let raw = serde_json::to_string(self).unwrap_or_default();
        store.set(CURRENT_SESSION_KEY, &raw)
    }
}
