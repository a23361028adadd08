//! vmgrid-store: the consistent key-value store every daemon shares.
//!
//! Backed by [redb](https://docs.rs/redb). The surface mirrors what an
//! etcd v3 client offers the rest of the system: point reads and writes,
//! ordered prefix scans, compare-and-swap, atomic multi-key batches, and a
//! prefix watch.
//!
//! # Architecture
//!
//! All values are opaque bytes, in practice JSON documents. Keys follow
//! the layout in [`keys`]: `/sf/<objecttype>/<subtype>/<name>` for data and
//! `/sflocks/...` for lock records.
//!
//! The `KvStore` is `Clone` + `Send` + `Sync` (backed by an `Arc`) and can
//! be shared across async tasks and blocking threads.

pub mod error;
pub mod keys;
pub mod store;
pub mod tables;
pub mod watch;

pub use error::{StoreError, StoreResult};
pub use keys::*;
pub use store::{KvOp, KvStore, decode};
pub use watch::{WatchError, WatchEvent, Watcher};
