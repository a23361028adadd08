//! Prefix watches over the store's change feed.
//!
//! Every committed mutation is published on a broadcast channel in commit
//! order. A [`Watcher`] filters that feed down to one key prefix.

use tokio::sync::broadcast;

/// A single committed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    /// The watcher fell behind and `skipped` events were dropped. The
    /// consumer must rescan the prefix to resynchronise.
    #[error("watcher lagged, {skipped} events dropped")]
    Lagged { skipped: u64 },

    #[error("store closed")]
    Closed,
}

/// Receives changes under a key prefix.
pub struct Watcher {
    prefix: String,
    rx: broadcast::Receiver<WatchEvent>,
}

impl Watcher {
    pub(crate) fn new(prefix: String, rx: broadcast::Receiver<WatchEvent>) -> Self {
        Self { prefix, rx }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Wait for the next event under this watcher's prefix.
    pub async fn recv(&mut self) -> Result<WatchEvent, WatchError> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.key().starts_with(&self.prefix) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Err(WatchError::Lagged { skipped });
                }
                Err(broadcast::error::RecvError::Closed) => return Err(WatchError::Closed),
            }
        }
    }

    /// Return a pending event without waiting, if one is queued.
    pub fn try_recv(&mut self) -> Result<Option<WatchEvent>, WatchError> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if event.key().starts_with(&self.prefix) => return Ok(Some(event)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    return Err(WatchError::Lagged { skipped });
                }
                Err(broadcast::error::TryRecvError::Closed) => return Err(WatchError::Closed),
            }
        }
    }
}
