//! vmgrid-coord: coordination primitives built on the shared store.
//!
//! Daemons on every node cooperate only through the store. This crate
//! layers the protocols they need on top of it:
//!
//! - **`lock`**: leased, named mutual exclusion with holder identity
//! - **`reaper`**: reclamation of locks left behind by dead processes
//! - **`tasks`**: the closed set of work item kinds and their decoding
//! - **`queue`**: durable per-node queues with queue → processing moves
//! - **`live`**: an in-memory, watch-fed view of one queue
//! - **`cache`**: object state → identifier indexes and blob hash lookups
//!
//! # Architecture
//!
//! ```text
//! WorkQueue / StateCache
//!   ├── LockManager (one lock per queue name / object type)
//!   └── KvStore (queue/, processing/, cache/ prefixes)
//! LiveQueue
//!   └── actor task (owns the index; fed by a prefix watch + commands)
//! ```

pub mod cache;
pub mod error;
pub mod live;
pub mod lock;
pub mod queue;
pub mod reaper;
pub mod tasks;

pub use cache::{ALL_STATE, HARD_DELETED, StateBucket, StateCache};
pub use error::{CoordError, CoordResult};
pub use live::LiveQueue;
pub use lock::{DistributedLock, LockGuard, LockHolder, LockManager, refresh_locks};
pub use queue::{
    JobPhase, MAX_JOB_NAME_ATTEMPTS, OutstandingJob, QueueLength, WorkQueue, job_deadline, job_name,
};
pub use reaper::{StaleLockSweeper, clear_stale_locks, pid_exists};
pub use tasks::{TASK_VERSION, Task, TaskKind, WorkItem, decode_task};
