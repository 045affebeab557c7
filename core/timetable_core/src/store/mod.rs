//! String key-value persistence behind the session.

use std::collections::HashMap;

pub mod remote;
pub mod sqlite;

pub use remote::RemoteStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("remote store: {0}")]
    Remote(#[from] reqwest::Error),
    #[error("remote store returned http {0}")]
    RemoteStatus(u16),
    #[error("remote writer stopped")]
    WriterClosed,
    #[error("store is read-only")]
    ReadOnly,
}

pub trait KeyValueStore: Send {
    fn get(&mut self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;

    /// Failure of a write that completed after `set`/`remove` already returned.
    ///
    /// Only stores that write in the background report anything here; the error is
    /// handed out once.
    fn take_deferred_error(&mut self) -> Option<StoreError> {
        None
    }
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: HashMap<String, String>,
    fail_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with [`StoreError::ReadOnly`].
    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.map.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        self.map.remove(key);
        Ok(())
    }
}
