//! Distributed locks.
//!
//! A lock is a record at `/sflocks/sf/<objecttype>/<subtype>/<name>` whose
//! value names the holder (`node`, `pid`, an optional operation, and a
//! random acquisition id) and the lease expiry. Acquisition and release
//! are compare-and-swap operations against the store, so two processes
//! can never both believe they hold the same lock.
//!
//! [`DistributedLock::try_acquire`] is the single-attempt primitive;
//! [`DistributedLock::acquire`] layers the poll-until-timeout policy and
//! slow-lock diagnostics on top. A [`LockGuard`] releases on drop.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use vmgrid_core::{GridConfig, epoch_secs_f64};
use vmgrid_store::{KvStore, LOCK_PREFIX, construct_key, decode, lock_key};

use crate::error::{CoordError, CoordResult};

const DEFAULT_TTL: Duration = Duration::from_secs(60);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_secs(5);

/// The value stored at a lock key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockHolder {
    pub node: String,
    pub pid: u32,
    #[serde(default)]
    pub operation: Option<String>,
    /// Unique per acquisition.
    pub id: String,
    /// Lease expiry, epoch seconds.
    pub expires_at: f64,
}

impl LockHolder {
    pub fn is_expired(&self, now: f64) -> bool {
        self.expires_at <= now
    }
}

/// Hands out locks stamped with this process's identity and the
/// configured timing policy.
#[derive(Clone)]
pub struct LockManager {
    store: KvStore,
    node: String,
    pid: u32,
    ttl: Duration,
    timeout: Duration,
    poll_interval: Duration,
    slow_threshold: Duration,
}

impl LockManager {
    pub fn new(store: KvStore, node: impl Into<String>) -> Self {
        Self {
            store,
            node: node.into(),
            pid: std::process::id(),
            ttl: DEFAULT_TTL,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
        }
    }

    pub fn from_config(store: KvStore, config: &GridConfig) -> Self {
        Self::new(store, config.node_name.clone())
            .with_ttl(Duration::from_secs(config.lock_ttl))
            .with_timeout(Duration::from_secs(config.lock_timeout))
            .with_poll_interval(config.lock_poll_interval())
            .with_slow_threshold(config.slow_lock_threshold())
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    /// Override the recorded process id. Used to simulate other holders.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    /// An unacquired lock on `/sf/<objecttype>/<subtype>/<name>`.
    pub fn get_lock(&self, objecttype: &str, subtype: &str, name: &str) -> DistributedLock {
        let path = construct_key(objecttype, subtype, name);
        DistributedLock {
            store: self.store.clone(),
            key: lock_key(&path),
            path,
            node: self.node.clone(),
            pid: self.pid,
            operation: None,
            ttl: self.ttl,
            timeout: self.timeout,
            poll_interval: self.poll_interval,
            slow_threshold: self.slow_threshold,
        }
    }

    /// Acquire a lock with the default policy, tagging it with `operation`.
    pub async fn acquire(
        &self,
        objecttype: &str,
        subtype: &str,
        name: &str,
        operation: &str,
    ) -> CoordResult<LockGuard> {
        self.get_lock(objecttype, subtype, name)
            .with_operation(operation)
            .acquire()
            .await
    }

    /// Every lock record in the store, keyed by lock key. Malformed
    /// records are skipped.
    pub fn get_existing_locks(&self) -> CoordResult<BTreeMap<String, LockHolder>> {
        let mut locks = BTreeMap::new();
        for (key, bytes) in self.store.get_prefix(&format!("{LOCK_PREFIX}/"), 0)? {
            match decode::<LockHolder>(&key, &bytes) {
                Ok(holder) => {
                    locks.insert(key, holder);
                }
                Err(e) => warn!(lock = %key, error = %e, "ignoring malformed lock record"),
            }
        }
        Ok(locks)
    }
}

/// A lock that has not been acquired yet.
pub struct DistributedLock {
    store: KvStore,
    path: String,
    key: String,
    node: String,
    pid: u32,
    operation: Option<String>,
    ttl: Duration,
    timeout: Duration,
    poll_interval: Duration,
    slow_threshold: Duration,
}

impl DistributedLock {
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current holder of this lock, if any (expired or not).
    pub fn get_holder(&self) -> CoordResult<Option<LockHolder>> {
        read_holder(&self.store, &self.key)
    }

    /// One acquisition attempt. Returns `None` if someone else holds an
    /// unexpired lease.
    pub fn try_acquire(&self) -> CoordResult<Option<LockGuard>> {
        let now = epoch_secs_f64();
        let current = self.store.get(&self.key)?;

        if let Some(bytes) = &current {
            match decode::<LockHolder>(&self.key, bytes) {
                Ok(holder) if !holder.is_expired(now) => return Ok(None),
                Ok(holder) => {
                    debug!(lock = %self.path, old_node = %holder.node, old_pid = holder.pid, "taking over expired lock");
                }
                Err(e) => {
                    // No lease can be read, so the record is reclaimed. The
                    // swap below only succeeds against these exact bytes.
                    warn!(lock = %self.path, error = %e, "reclaiming malformed lock record");
                }
            }
        }

        let holder = LockHolder {
            node: self.node.clone(),
            pid: self.pid,
            operation: self.operation.clone(),
            id: uuid::Uuid::new_v4().to_string(),
            expires_at: now + self.ttl.as_secs_f64(),
        };
        let bytes = serde_json::to_vec(&holder).map_err(|e| CoordError::Serialize(e.to_string()))?;

        if !self
            .store
            .compare_and_swap(&self.key, current.as_deref(), Some(&bytes))?
        {
            return Ok(None);
        }

        // Confirm the record we wrote is the one on file.
        let on_file = self.get_holder()?;
        if on_file.as_ref().map(|h| h.id.as_str()) != Some(holder.id.as_str()) {
            error!(
                lock = %self.path,
                current_id = ?on_file.map(|h| h.id),
                "we should hold lock, but do not"
            );
            return Ok(None);
        }

        Ok(Some(LockGuard {
            store: self.store.clone(),
            path: self.path.clone(),
            key: self.key.clone(),
            holder,
            bytes,
            ttl: self.ttl,
            released: false,
        }))
    }

    /// Poll [`try_acquire`](Self::try_acquire) until it succeeds or the
    /// timeout elapses. Reports the current holder once the wait exceeds
    /// the slow-lock threshold.
    pub async fn acquire(self) -> CoordResult<LockGuard> {
        let start = Instant::now();
        let mut slow_warned = false;

        loop {
            if let Some(guard) = self.try_acquire()? {
                let waited = start.elapsed();
                if waited > self.slow_threshold {
                    info!(
                        lock = %self.path,
                        operation = ?self.operation,
                        duration = waited.as_secs_f64(),
                        "acquired lock, but it was slow"
                    );
                } else {
                    debug!(lock = %self.path, operation = ?self.operation, "acquired lock");
                }
                return Ok(guard);
            }

            let waited = start.elapsed();
            if waited >= self.timeout {
                break;
            }

            if waited > self.slow_threshold && !slow_warned {
                let current = self.get_holder().ok().flatten();
                info!(
                    lock = %self.path,
                    operation = ?self.operation,
                    current_node = ?current.as_ref().map(|h| h.node.as_str()),
                    current_pid = ?current.as_ref().map(|h| h.pid),
                    current_operation = ?current.as_ref().and_then(|h| h.operation.as_deref()),
                    duration = waited.as_secs_f64(),
                    threshold = self.slow_threshold.as_secs_f64(),
                    "waiting to acquire lock"
                );
                slow_warned = true;
            }

            tokio::time::sleep(self.poll_interval.min(self.timeout - waited)).await;
        }

        let waited = start.elapsed().as_secs_f64();
        let current = self.get_holder().ok().flatten();
        warn!(
            lock = %self.path,
            operation = ?self.operation,
            current_node = ?current.as_ref().map(|h| h.node.as_str()),
            current_pid = ?current.as_ref().map(|h| h.pid),
            duration = waited,
            "failed to acquire lock"
        );
        Err(CoordError::LockTimeout {
            path: self.path,
            waited_secs: waited,
        })
    }
}

/// Proof of holding a lock. Dropping the guard releases the lock; call
/// [`LockGuard::release`] to observe release failures.
pub struct LockGuard {
    store: KvStore,
    path: String,
    key: String,
    holder: LockHolder,
    /// Exact bytes we wrote; release and refresh compare against them.
    bytes: Vec<u8>,
    ttl: Duration,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }

    /// True while our record is on file and its lease has not lapsed.
    pub fn is_acquired(&self) -> CoordResult<bool> {
        let current = self.store.get(&self.key)?;
        Ok(current.as_deref() == Some(self.bytes.as_slice())
            && !self.holder.is_expired(epoch_secs_f64()))
    }

    /// Extend the lease. Fails with `LockExpired` if the lease already
    /// lapsed or another holder replaced us.
    pub fn refresh(&mut self) -> CoordResult<()> {
        if !self.is_acquired()? {
            info!(lock = %self.path, "attempt to refresh an expired lock");
            return Err(CoordError::LockExpired(self.path.clone()));
        }

        let mut holder = self.holder.clone();
        holder.expires_at = epoch_secs_f64() + self.ttl.as_secs_f64();
        let bytes = serde_json::to_vec(&holder).map_err(|e| CoordError::Serialize(e.to_string()))?;

        if !self
            .store
            .compare_and_swap(&self.key, Some(&self.bytes), Some(&bytes))?
        {
            return Err(CoordError::LockExpired(self.path.clone()));
        }
        self.holder = holder;
        self.bytes = bytes;
        debug!(lock = %self.path, "refreshed lock");
        Ok(())
    }

    /// Release the lock. A release that finds someone else's record on
    /// file is a protocol violation and is reported as `LockRelease`.
    pub fn release(mut self) -> CoordResult<()> {
        self.released = true;
        self.release_inner()
    }

    fn release_inner(&self) -> CoordResult<()> {
        if self
            .store
            .compare_and_swap(&self.key, Some(&self.bytes), None)?
        {
            debug!(lock = %self.path, "released lock");
            return Ok(());
        }

        let current = read_holder(&self.store, &self.key).ok().flatten();
        error!(
            lock = %self.path,
            our_id = %self.holder.id,
            current_node = ?current.as_ref().map(|h| h.node.as_str()),
            current_pid = ?current.as_ref().map(|h| h.pid),
            current_id = ?current.as_ref().map(|h| h.id.as_str()),
            "failed to release lock"
        );
        Err(CoordError::LockRelease(self.path.clone()))
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("path", &self.path)
            .field("key", &self.key)
            .field("holder", &self.holder)
            .field("ttl", &self.ttl)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.release_inner() {
            error!(lock = %self.path, error = %e, "lock release on drop failed");
        }
    }
}

/// Refresh several held locks, stopping at the first failure.
pub fn refresh_locks(locks: &mut [LockGuard]) -> CoordResult<()> {
    for lock in locks.iter_mut() {
        lock.refresh()?;
    }
    Ok(())
}

fn read_holder(store: &KvStore, key: &str) -> CoordResult<Option<LockHolder>> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(decode(key, &bytes)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_locks(store: &KvStore) -> LockManager {
        LockManager::new(store.clone(), "node01")
            .with_timeout(Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(10))
            .with_slow_threshold(Duration::from_millis(50))
    }

    #[test]
    fn try_acquire_records_holder_identity() {
        let store = KvStore::open_in_memory().unwrap();
        let locks = fast_locks(&store);

        let guard = locks
            .get_lock("instance", "", "abc")
            .with_operation("test op")
            .try_acquire()
            .unwrap()
            .unwrap();
        assert_eq!(guard.path(), "/sf/instance/abc");

        let existing = locks.get_existing_locks().unwrap();
        let holder = existing.get("/sflocks/sf/instance/abc").unwrap();
        assert_eq!(holder.node, "node01");
        assert_eq!(holder.pid, std::process::id());
        assert_eq!(holder.operation.as_deref(), Some("test op"));
        assert_eq!(holder.id, guard.holder().id);
    }

    #[test]
    fn second_try_acquire_fails_while_held() {
        let store = KvStore::open_in_memory().unwrap();
        let locks = fast_locks(&store);

        let first = locks.get_lock("queue", "", "q").try_acquire().unwrap();
        assert!(first.is_some());
        assert!(locks.get_lock("queue", "", "q").try_acquire().unwrap().is_none());

        first.unwrap().release().unwrap();
        assert!(locks.get_lock("queue", "", "q").try_acquire().unwrap().is_some());
    }

    #[tokio::test]
    async fn acquire_times_out_when_held() {
        let store = KvStore::open_in_memory().unwrap();
        let locks = fast_locks(&store);

        let _held = locks.acquire("queue", "", "q", "holder").await.unwrap();
        let err = locks.acquire("queue", "", "q", "waiter").await.unwrap_err();
        match err {
            CoordError::LockTimeout { path, waited_secs } => {
                assert_eq!(path, "/sf/queue/q");
                assert!(waited_secs >= 0.2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn acquire_succeeds_after_holder_drops() {
        let store = KvStore::open_in_memory().unwrap();
        let locks = fast_locks(&store).with_timeout(Duration::from_secs(2));

        let held = locks.acquire("cache", "", "instance", "holder").await.unwrap();
        let waiter = tokio::spawn({
            let locks = locks.clone();
            async move { locks.acquire("cache", "", "instance", "waiter").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        let guard = waiter.await.unwrap().unwrap();
        assert_eq!(guard.holder().operation.as_deref(), Some("waiter"));
    }

    #[test]
    fn drop_releases_lock() {
        let store = KvStore::open_in_memory().unwrap();
        let locks = fast_locks(&store);
        {
            let _guard = locks.get_lock("node", "", "hv1").try_acquire().unwrap().unwrap();
            assert_eq!(locks.get_existing_locks().unwrap().len(), 1);
        }
        assert!(locks.get_existing_locks().unwrap().is_empty());
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let store = KvStore::open_in_memory().unwrap();
        let short = fast_locks(&store).with_ttl(Duration::ZERO);
        let stale = short.get_lock("network", "", "net1").try_acquire().unwrap().unwrap();

        let locks = fast_locks(&store);
        let fresh = locks.get_lock("network", "", "net1").try_acquire().unwrap();
        assert!(fresh.is_some());

        // The stale guard no longer owns the record.
        assert!(!stale.is_acquired().unwrap());
        assert!(matches!(stale.release(), Err(CoordError::LockRelease(_))));
    }

    #[test]
    fn refresh_extends_lease() {
        let store = KvStore::open_in_memory().unwrap();
        let locks = fast_locks(&store).with_ttl(Duration::from_secs(30));
        let mut guard = locks.get_lock("instance", "", "i1").try_acquire().unwrap().unwrap();
        let before = guard.holder().expires_at;

        std::thread::sleep(Duration::from_millis(5));
        guard.refresh().unwrap();
        assert!(guard.holder().expires_at > before);
        assert!(guard.is_acquired().unwrap());
    }

    #[test]
    fn refresh_of_expired_lock_fails() {
        let store = KvStore::open_in_memory().unwrap();
        let locks = fast_locks(&store).with_ttl(Duration::ZERO);
        let mut guard = locks.get_lock("instance", "", "i1").try_acquire().unwrap().unwrap();

        assert!(matches!(guard.refresh(), Err(CoordError::LockExpired(_))));
    }

    #[test]
    fn refresh_locks_refreshes_each() {
        let store = KvStore::open_in_memory().unwrap();
        let locks = fast_locks(&store).with_ttl(Duration::from_secs(30));
        let mut guards = vec![
            locks.get_lock("instance", "", "a").try_acquire().unwrap().unwrap(),
            locks.get_lock("instance", "", "b").try_acquire().unwrap().unwrap(),
        ];
        refresh_locks(&mut guards).unwrap();
        assert!(guards.iter().all(|g| g.is_acquired().unwrap()));
    }

    #[test]
    fn malformed_lock_record_is_reclaimed() {
        let store = KvStore::open_in_memory().unwrap();
        store.put("/sflocks/sf/instance/bad", b"garbage").unwrap();
        let locks = fast_locks(&store);

        let guard = locks.get_lock("instance", "", "bad").try_acquire().unwrap().unwrap();
        assert_eq!(guard.holder().node, "node01");
        assert!(locks.get_existing_locks().unwrap().contains_key("/sflocks/sf/instance/bad"));
        guard.release().unwrap();
        assert!(store.get("/sflocks/sf/instance/bad").unwrap().is_none());
    }

    #[tokio::test]
    async fn acquire_takes_over_malformed_record() {
        let store = KvStore::open_in_memory().unwrap();
        store.put("/sflocks/sf/instance/bad", b"garbage").unwrap();
        let locks = fast_locks(&store).with_timeout(Duration::from_millis(300));

        let guard = locks.acquire("instance", "", "bad", "test").await.unwrap();
        assert!(guard.is_acquired().unwrap());
    }
}
