//! Reclaim locks whose holding process has died.
//!
//! Only locks recorded against this node are considered, since process
//! liveness can only be checked locally. Each stale record is removed
//! with a compare-and-swap against the exact bytes observed, so a lock
//! re-acquired between the scan and the delete is never touched.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use vmgrid_store::{KvStore, LOCK_PREFIX, decode};

use crate::error::CoordResult;
use crate::lock::LockHolder;

/// Whether a process with this pid exists on the local host.
pub fn pid_exists(pid: u32) -> bool {
    // pid 0 addresses the caller's process group, not a process.
    if pid == 0 {
        return false;
    }
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs permission and existence checks only and
    // delivers nothing.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Delete every lock held by a dead process on `node`, and any lock record
/// that cannot be decoded. Returns the lock keys that were reclaimed.
pub fn clear_stale_locks(store: &KvStore, node: &str) -> CoordResult<Vec<String>> {
    let mut cleared = Vec::new();

    for (key, bytes) in store.get_prefix(&format!("{LOCK_PREFIX}/"), 0)? {
        let holder: LockHolder = match decode(&key, &bytes) {
            Ok(holder) => holder,
            Err(e) => {
                // A record without a readable holder has no lease to wait out.
                if store.compare_and_swap(&key, Some(&bytes), None)? {
                    warn!(lock = %key, error = %e, "removed malformed lock record");
                    cleared.push(key);
                }
                continue;
            }
        };

        if holder.node != node || pid_exists(holder.pid) {
            continue;
        }

        if store.compare_and_swap(&key, Some(&bytes), None)? {
            warn!(
                lock = %key,
                pid = holder.pid,
                operation = ?holder.operation,
                "removed stale lock"
            );
            cleared.push(key);
        } else {
            debug!(lock = %key, "stale lock changed before removal, leaving it");
        }
    }

    Ok(cleared)
}

/// Periodically runs [`clear_stale_locks`] for this node.
pub struct StaleLockSweeper {
    store: KvStore,
    node: String,
    interval: Duration,
}

impl StaleLockSweeper {
    pub fn new(store: KvStore, node: impl Into<String>, interval: Duration) -> Self {
        Self {
            store,
            node: node.into(),
            interval,
        }
    }

    /// One sweep. Errors are logged, never returned.
    pub fn sweep_once(&self) -> usize {
        match clear_stale_locks(&self.store, &self.node) {
            Ok(cleared) => cleared.len(),
            Err(e) => {
                warn!(node = %self.node, error = %e, "stale lock sweep failed");
                0
            }
        }
    }

    /// Sweep on every interval until the shutdown signal fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            node = %self.node,
            interval_secs = self.interval.as_secs(),
            "stale lock sweeper started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let cleared = self.sweep_once();
                    if cleared > 0 {
                        info!(node = %self.node, cleared, "stale locks reclaimed");
                    }
                }
                _ = shutdown.changed() => {
                    info!(node = %self.node, "stale lock sweeper shutting down");
                    break;
                }
            }
        }
    }
}
