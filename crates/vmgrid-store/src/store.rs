//! KvStore: redb-backed consistent key-value store.
//!
//! Provides point reads/writes, ordered prefix scans, compare-and-swap,
//! atomic batches, and prefix watches. Every read runs in one redb read
//! transaction, so a prefix scan is a consistent snapshot. Every mutation
//! runs in one write transaction and is published to watchers after it
//! commits.

use std::path::Path;
use std::sync::{Arc, Mutex};

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::tables::KV;
use crate::watch::{WatchEvent, Watcher};

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Buffered change events per watcher before it is reported as lagged.
const WATCH_CHANNEL_CAPACITY: usize = 4096;

/// A single mutation inside an atomic [`KvStore::batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl KvOp {
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        KvOp::Put {
            key: key.into(),
            value,
        }
    }

    pub fn put_json<T: Serialize>(key: impl Into<String>, value: &T) -> StoreResult<Self> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        Ok(KvOp::put(key, value))
    }

    pub fn delete(key: impl Into<String>) -> Self {
        KvOp::Delete { key: key.into() }
    }
}

struct Inner {
    db: Database,
    events: broadcast::Sender<WatchEvent>,
    /// Held across commit and publish so watchers observe commit order.
    write_gate: Mutex<()>,
}

/// Thread-safe key-value store backed by redb.
#[derive(Clone)]
pub struct KvStore {
    inner: Arc<Inner>,
}

impl KvStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!(?path, "kv store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory kv store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> StoreResult<Self> {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        let store = Self {
            inner: Arc::new(Inner {
                db,
                events,
                write_gate: Mutex::new(()),
            }),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(KV).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run a write transaction and publish the events it produced, in
    /// commit order relative to every other writer.
    fn write<R>(
        &self,
        body: impl FnOnce(&mut redb::Table<'_, &'static str, &'static [u8]>) -> StoreResult<(R, Vec<WatchEvent>)>,
    ) -> StoreResult<R> {
        let _gate = self
            .inner
            .write_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        let (result, events) = {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            body(&mut table)?
        };
        txn.commit().map_err(map_err!(Transaction))?;
        for event in events {
            // No receivers is not an error; nobody is watching.
            let _ = self.inner.events.send(event);
        }
        Ok(result)
    }

    // ── Point operations ───────────────────────────────────────────

    pub fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        let value = table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    pub fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.write(|table| {
            table.insert(key, value).map_err(map_err!(Write))?;
            Ok((
                (),
                vec![WatchEvent::Put {
                    key: key.to_string(),
                    value: value.to_vec(),
                }],
            ))
        })?;
        debug!(%key, "kv put");
        Ok(())
    }

    /// Delete a key. Returns true if it existed.
    pub fn delete(&self, key: &str) -> StoreResult<bool> {
        let existed = self.write(|table| {
            let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
            let events = if existed {
                vec![WatchEvent::Delete {
                    key: key.to_string(),
                }]
            } else {
                Vec::new()
            };
            Ok((existed, events))
        })?;
        debug!(%key, existed, "kv delete");
        Ok(existed)
    }

    // ── Range operations ───────────────────────────────────────────

    /// All entries under `prefix`, ascending by key. A `limit` of zero
    /// means unlimited.
    pub fn get_prefix(&self, prefix: &str, limit: usize) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range::<&str>(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key.to_string(), value.value().to_vec()));
            if limit > 0 && results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    /// Delete every key under `prefix`. Returns the number removed.
    pub fn delete_prefix(&self, prefix: &str) -> StoreResult<usize> {
        let removed = self.write(|table| {
            let keys: Vec<String> = {
                let mut keys = Vec::new();
                for entry in table.range::<&str>(prefix..).map_err(map_err!(Read))? {
                    let (key, _) = entry.map_err(map_err!(Read))?;
                    let key = key.value();
                    if !key.starts_with(prefix) {
                        break;
                    }
                    keys.push(key.to_string());
                }
                keys
            };
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            let events = keys
                .iter()
                .map(|key| WatchEvent::Delete { key: key.clone() })
                .collect();
            Ok((keys.len(), events))
        })?;
        debug!(%prefix, removed, "kv delete prefix");
        Ok(removed)
    }

    // ── Transactions ───────────────────────────────────────────────

    /// Replace the value at `key` only if it currently equals `expected`.
    ///
    /// `expected = None` requires the key to be absent; `new = None`
    /// deletes it. Returns false, changing nothing, on mismatch.
    pub fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> StoreResult<bool> {
        self.write(|table| {
            let current = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            if current.as_deref() != expected {
                return Ok((false, Vec::new()));
            }
            let event = match new {
                Some(value) => {
                    table.insert(key, value).map_err(map_err!(Write))?;
                    Some(WatchEvent::Put {
                        key: key.to_string(),
                        value: value.to_vec(),
                    })
                }
                None => {
                    let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
                    existed.then(|| WatchEvent::Delete {
                        key: key.to_string(),
                    })
                }
            };
            Ok((true, event.into_iter().collect()))
        })
    }

    /// Apply several puts and deletes in a single transaction.
    pub fn batch(&self, ops: &[KvOp]) -> StoreResult<()> {
        self.write(|table| {
            let mut events = Vec::with_capacity(ops.len());
            for op in ops {
                match op {
                    KvOp::Put { key, value } => {
                        table
                            .insert(key.as_str(), value.as_slice())
                            .map_err(map_err!(Write))?;
                        events.push(WatchEvent::Put {
                            key: key.clone(),
                            value: value.clone(),
                        });
                    }
                    KvOp::Delete { key } => {
                        if table.remove(key.as_str()).map_err(map_err!(Write))?.is_some() {
                            events.push(WatchEvent::Delete { key: key.clone() });
                        }
                    }
                }
            }
            Ok(((), events))
        })?;
        debug!(ops = ops.len(), "kv batch committed");
        Ok(())
    }

    // ── Watches ────────────────────────────────────────────────────

    /// Subscribe to changes under `prefix`. Only mutations committed after
    /// this call are delivered.
    pub fn watch_prefix(&self, prefix: &str) -> Watcher {
        Watcher::new(prefix.to_string(), self.inner.events.subscribe())
    }

    // ── JSON helpers ───────────────────────────────────────────────

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        self.put(key, &bytes)
    }

    /// All entries under `prefix` decoded as `T`. Fails on the first
    /// malformed entry; callers wanting best-effort reads use
    /// [`KvStore::get_prefix`] and [`decode`] directly.
    pub fn get_prefix_json<T: DeserializeOwned>(
        &self,
        prefix: &str,
        limit: usize,
    ) -> StoreResult<Vec<(String, T)>> {
        self.get_prefix(prefix, limit)?
            .into_iter()
            .map(|(key, bytes)| {
                let value = decode(&key, &bytes)?;
                Ok((key, value))
            })
            .collect()
    }
}

/// Decode a JSON value read from `key`.
pub fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialize {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
