//! Cloud persistence over a PostgREST-style table (`key`, `value`, `updated_at`).
//!
//! Reads are served from a cache filled once at connect time. Writes update the
//! cache immediately and are queued to a background writer, so callers (including
//! the reminder tick) never wait on the network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::mpsc;
use tracing::{error, info};

use super::{KeyValueStore, StoreError};

const TABLE: &str = "timetable_kv";

#[derive(Serialize, Deserialize)]
struct Row {
    key: String,
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<String>,
}

#[derive(Debug)]
enum PendingWrite {
    Set { key: String, value: String },
    Remove { key: String },
}

#[derive(Clone)]
struct RemoteTable {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl RemoteTable {
    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn fetch_all(&self) -> Result<Vec<Row>, StoreError> {
        let url = format!("{}?select=key,value", self.endpoint);
        let res = self.authed(self.client.get(url)).send().await?;
        if !res.status().is_success() {
            return Err(StoreError::RemoteStatus(res.status().as_u16()));
        }
        Ok(res.json().await?)
    }

    async fn upsert(&self, key: String, value: String) -> Result<(), StoreError> {
        let row = Row {
            key,
            value,
            updated_at: OffsetDateTime::now_utc().format(&Rfc3339).ok(),
        };
        let res = self
            .authed(self.client.post(&self.endpoint))
            .header("Prefer", "resolution=merge-duplicates")
            .json(&[row])
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(StoreError::RemoteStatus(res.status().as_u16()));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let url = format!("{}?key=eq.{}", self.endpoint, urlencoding::encode(key));
        let res = self.authed(self.client.delete(url)).send().await?;
        if !res.status().is_success() {
            return Err(StoreError::RemoteStatus(res.status().as_u16()));
        }
        Ok(())
    }
}

pub struct RemoteStore {
    cache: HashMap<String, String>,
    tx: mpsc::UnboundedSender<PendingWrite>,
    deferred_error: Arc<Mutex<Option<StoreError>>>,
}

impl RemoteStore {
    /// Loads every row and starts the background writer. Must run inside a tokio runtime.
    pub async fn connect(base_url: &str, api_key: &str) -> Result<Self, StoreError> {
        let table = RemoteTable {
            client: Client::new(),
            endpoint: format!("{}/rest/v1/{TABLE}", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
        };

        let rows = table.fetch_all().await?;
        info!("remote store loaded {} rows from {}", rows.len(), table.endpoint);
        let cache = rows.into_iter().map(|r| (r.key, r.value)).collect();

        let (tx, rx) = mpsc::unbounded_channel();
        let deferred_error = Arc::new(Mutex::new(None));
        tokio::spawn(run_writer(table, rx, deferred_error.clone()));

        Ok(Self {
            cache,
            tx,
            deferred_error,
        })
    }

    fn enqueue(&self, write: PendingWrite) -> Result<(), StoreError> {
        self.tx.send(write).map_err(|_| StoreError::WriterClosed)
    }
}

async fn run_writer(
    table: RemoteTable,
    mut rx: mpsc::UnboundedReceiver<PendingWrite>,
    deferred_error: Arc<Mutex<Option<StoreError>>>,
) {
    while let Some(write) = rx.recv().await {
        let result = match write {
            PendingWrite::Set { key, value } => table.upsert(key, value).await,
            PendingWrite::Remove { key } => table.delete(&key).await,
        };
        if let Err(err) = result {
            error!("remote write failed: {err}");
            *deferred_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err);
        }
    }
}

impl KeyValueStore for RemoteStore {
    fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.cache.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.enqueue(PendingWrite::Set {
            key: key.to_string(),
            value: value.to_string(),
        })?;
        self.cache.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.enqueue(PendingWrite::Remove {
            key: key.to_string(),
        })?;
        self.cache.remove(key);
        Ok(())
    }

    fn take_deferred_error(&mut self) -> Option<StoreError> {
        self.deferred_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached(rows: &[(&str, &str)]) -> (RemoteStore, mpsc::UnboundedReceiver<PendingWrite>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = RemoteStore {
            cache: rows
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            tx,
            deferred_error: Arc::new(Mutex::new(None)),
        };
        (store, rx)
    }

    #[test]
    fn writes_hit_cache_and_queue() {
        let (mut store, mut rx) = detached(&[("a", "1")]);
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));

        store.set("b", "2").unwrap();
        store.remove("a").unwrap();
        assert_eq!(store.get("b").unwrap().as_deref(), Some("2"));
        assert_eq!(store.get("a").unwrap(), None);

        assert!(matches!(rx.try_recv(), Ok(PendingWrite::Set { key, value }) if key == "b" && value == "2"));
        assert!(matches!(rx.try_recv(), Ok(PendingWrite::Remove { key }) if key == "a"));
    }

    #[test]
    fn closed_writer_fails_the_write() {
        let (mut store, rx) = detached(&[]);
        drop(rx);
        assert!(matches!(store.set("k", "v"), Err(StoreError::WriterClosed)));
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn deferred_error_is_reported_once() {
        let (mut store, _rx) = detached(&[]);
        *store.deferred_error.lock().unwrap() = Some(StoreError::RemoteStatus(503));
        assert!(matches!(store.take_deferred_error(), Some(StoreError::RemoteStatus(503))));
        assert!(store.take_deferred_error().is_none());
    }
}
