//! Object state caches and the blob hash cache.
//!
//! `/sf/cache/<objecttype>/<state>` holds a JSON map of object uuid →
//! time of its last transition into that state. `_all_` tracks every
//! object of the type until it is hard deleted. Updates run under the
//! object type's lock; bulk reads rely on one consistent prefix scan.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use vmgrid_core::epoch_secs_f64;
use vmgrid_store::{KvOp, KvStore, construct_key, decode, last_segment};

use crate::error::CoordResult;
use crate::lock::LockManager;

/// Bucket listing every object not yet hard deleted.
pub const ALL_STATE: &str = "_all_";

/// Terminal state; leaving it removes the object from [`ALL_STATE`].
pub const HARD_DELETED: &str = "hard-deleted";

/// Object uuid → epoch seconds of its transition into the bucket's state.
pub type StateBucket = BTreeMap<String, f64>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
struct BlobHashEntry {
    #[serde(default)]
    blobs: Vec<String>,
}

#[derive(Clone)]
pub struct StateCache {
    store: KvStore,
    locks: LockManager,
}

impl StateCache {
    pub fn new(locks: LockManager) -> Self {
        Self {
            store: locks.store().clone(),
            locks,
        }
    }

    fn bucket_key(object_type: &str, state: &str) -> String {
        construct_key("cache", object_type, state)
    }

    /// One state bucket. A malformed bucket reads as empty.
    pub fn read(&self, object_type: &str, state: &str) -> CoordResult<StateBucket> {
        let key = Self::bucket_key(object_type, state);
        let Some(bytes) = self.store.get(&key)? else {
            return Ok(StateBucket::new());
        };
        match decode::<StateBucket>(&key, &bytes) {
            Ok(bucket) => Ok(bucket),
            Err(e) => {
                error!(%key, error = %e, "ignoring malformed cache entry");
                Ok(StateBucket::new())
            }
        }
    }

    /// Uuids of every object of `object_type` in any of `states`.
    pub fn read_many(&self, object_type: &str, states: &[&str]) -> CoordResult<Vec<String>> {
        let mut out = Vec::new();
        for (key, bytes) in self.store.get_prefix(&construct_key("cache", object_type, ""), 0)? {
            let state = last_segment(&key);
            if state.is_empty() || !states.contains(&state) {
                continue;
            }
            match decode::<StateBucket>(&key, &bytes) {
                Ok(bucket) => out.extend(bucket.into_keys()),
                Err(e) => error!(%key, error = %e, "ignoring malformed cache entry"),
            }
        }
        Ok(out)
    }

    /// Record that `object_uuid` moved from `old_state` to `new_state`.
    pub async fn update(
        &self,
        object_type: &str,
        object_uuid: &str,
        old_state: Option<&str>,
        new_state: &str,
    ) -> CoordResult<()> {
        let guard = self
            .locks
            .acquire("cache", "", object_type, "object state cache update")
            .await?;
        let written = self.apply_transition(object_type, object_uuid, old_state, new_state);
        guard.release()?;
        written
    }

    fn apply_transition(
        &self,
        object_type: &str,
        object_uuid: &str,
        old_state: Option<&str>,
        new_state: &str,
    ) -> CoordResult<()> {
        let now = epoch_secs_f64();
        let mut changed: BTreeMap<&str, StateBucket> = BTreeMap::new();

        let mut all = self.read(object_type, ALL_STATE)?;
        if new_state == HARD_DELETED {
            if all.remove(object_uuid).is_some() {
                changed.insert(ALL_STATE, all);
            }
        } else if !all.contains_key(object_uuid) {
            all.insert(object_uuid.to_string(), now);
            changed.insert(ALL_STATE, all);
        }

        if let Some(old_state) = old_state.filter(|old| *old != new_state) {
            let mut old = self.read(object_type, old_state)?;
            if old.remove(object_uuid).is_some() {
                changed.insert(old_state, old);
            }
        }

        let mut new = self.read(object_type, new_state)?;
        new.insert(object_uuid.to_string(), now);
        changed.insert(new_state, new);

        let ops = changed
            .iter()
            .map(|(state, bucket)| KvOp::put_json(Self::bucket_key(object_type, state), bucket))
            .collect::<Result<Vec<_>, _>>()?;
        self.store.batch(&ops)?;

        debug!(
            object_type,
            object_uuid,
            old_state = ?old_state,
            new_state,
            buckets = ops.len(),
            "updated object state cache"
        );
        Ok(())
    }

    /// Replace a bucket wholesale. The caller must hold the object type's
    /// cache lock.
    pub fn clobber(&self, object_type: &str, state: &str, bucket: &StateBucket) -> CoordResult<()> {
        self.store
            .put_json(&Self::bucket_key(object_type, state), bucket)?;
        Ok(())
    }

    /// Record that `blob_uuid` has each of `hashes` (algorithm → digest).
    pub async fn update_blob_hash_cache(
        &self,
        blob_uuid: &str,
        hashes: &BTreeMap<String, String>,
    ) -> CoordResult<()> {
        for (alg, hash) in hashes {
            let guard = self
                .locks
                .acquire("blob_by_hash", alg, hash, "blob hash cache update")
                .await?;
            let written = self.append_blob(alg, hash, blob_uuid);
            guard.release()?;
            written?;
        }
        Ok(())
    }

    fn append_blob(&self, alg: &str, hash: &str, blob_uuid: &str) -> CoordResult<()> {
        let key = construct_key("blob_by_hash", alg, hash);
        let mut entry = self.read_blob_entry(&key)?;
        if !entry.blobs.iter().any(|b| b == blob_uuid) {
            entry.blobs.push(blob_uuid.to_string());
            self.store.put_json(&key, &entry)?;
        }
        Ok(())
    }

    fn read_blob_entry(&self, key: &str) -> CoordResult<BlobHashEntry> {
        let Some(bytes) = self.store.get(key)? else {
            return Ok(BlobHashEntry::default());
        };
        match decode(key, &bytes) {
            Ok(entry) => Ok(entry),
            Err(e) => {
                warn!(%key, error = %e, "ignoring malformed blob hash entry");
                Ok(BlobHashEntry::default())
            }
        }
    }

    /// Blobs recorded with this digest.
    pub fn search_blob_hash_cache(&self, alg: &str, hash: &str) -> CoordResult<Vec<String>> {
        Ok(self
            .read_blob_entry(&construct_key("blob_by_hash", alg, hash))?
            .blobs)
    }

    /// States in which `object_uuid` currently appears, `_all_` excluded.
    pub fn states_of(&self, object_type: &str, object_uuid: &str) -> CoordResult<BTreeSet<String>> {
        let mut states = BTreeSet::new();
        for (key, bytes) in self.store.get_prefix(&construct_key("cache", object_type, ""), 0)? {
            let state = last_segment(&key);
            if state == ALL_STATE {
                continue;
            }
            if let Ok(bucket) = decode::<StateBucket>(&key, &bytes) {
                if bucket.contains_key(object_uuid) {
                    states.insert(state.to_string());
                }
            }
        }
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn cache() -> StateCache {
        let store = KvStore::open_in_memory().unwrap();
        StateCache::new(
            LockManager::new(store, "node01").with_poll_interval(Duration::from_millis(5)),
        )
    }

    #[tokio::test]
    async fn transitions_move_between_buckets() {
        let c = cache();
        c.update("instance", "i1", None, "initial").await.unwrap();
        c.update("instance", "i1", Some("initial"), "created").await.unwrap();

        assert!(c.read("instance", "initial").unwrap().is_empty());
        assert!(c.read("instance", "created").unwrap().contains_key("i1"));
        assert!(c.read("instance", ALL_STATE).unwrap().contains_key("i1"));
        assert_eq!(
            c.states_of("instance", "i1").unwrap(),
            BTreeSet::from(["created".to_string()])
        );
    }

    #[tokio::test]
    async fn hard_delete_leaves_all_bucket() {
        let c = cache();
        c.update("network", "n1", None, "created").await.unwrap();
        c.update("network", "n1", Some("created"), "deleted").await.unwrap();
        assert!(c.read("network", ALL_STATE).unwrap().contains_key("n1"));

        c.update("network", "n1", Some("deleted"), HARD_DELETED).await.unwrap();
        assert!(!c.read("network", ALL_STATE).unwrap().contains_key("n1"));
        assert_eq!(
            c.states_of("network", "n1").unwrap(),
            BTreeSet::from([HARD_DELETED.to_string()])
        );
    }

    #[tokio::test]
    async fn same_state_update_keeps_entry() {
        let c = cache();
        c.update("instance", "i1", None, "created").await.unwrap();
        c.update("instance", "i1", Some("created"), "created").await.unwrap();
        assert!(c.read("instance", "created").unwrap().contains_key("i1"));
    }

    #[tokio::test]
    async fn read_many_filters_states() {
        let c = cache();
        c.update("instance", "a", None, "created").await.unwrap();
        c.update("instance", "b", None, "error").await.unwrap();
        c.update("instance", "c", None, "deleted").await.unwrap();
        c.update("node", "n", None, "created").await.unwrap();

        let mut found = c.read_many("instance", &["created", "error"]).unwrap();
        found.sort();
        assert_eq!(found, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn malformed_buckets_read_empty() {
        let c = cache();
        c.store.put("/sf/cache/instance/created", b"[1, 2]").unwrap();
        c.update("instance", "ok", None, "error").await.unwrap();

        assert!(c.read("instance", "created").unwrap().is_empty());
        assert_eq!(c.read_many("instance", &["created", "error"]).unwrap(), vec!["ok".to_string()]);
    }

    #[test]
    fn clobber_replaces_bucket() {
        let c = cache();
        let bucket = StateBucket::from([("x".to_string(), 1.0), ("y".to_string(), 2.0)]);
        c.clobber("instance", "created", &bucket).unwrap();
        assert_eq!(c.read("instance", "created").unwrap(), bucket);
    }

    #[tokio::test]
    async fn blob_hash_cache_deduplicates() {
        let c = cache();
        let hashes = BTreeMap::from([
            ("sha512".to_string(), "aaaa".to_string()),
            ("md5".to_string(), "bbbb".to_string()),
        ]);
        c.update_blob_hash_cache("blob1", &hashes).await.unwrap();
        c.update_blob_hash_cache("blob1", &hashes).await.unwrap();
        c.update_blob_hash_cache("blob2", &hashes).await.unwrap();

        assert_eq!(
            c.search_blob_hash_cache("sha512", "aaaa").unwrap(),
            vec!["blob1".to_string(), "blob2".to_string()]
        );
        assert!(c.search_blob_hash_cache("sha512", "cccc").unwrap().is_empty());
    }
}
