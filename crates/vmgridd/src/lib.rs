//! vmgridd: the vmgrid node daemon.
//!
//! Library half of the daemon binary, so node startup and the queue
//! worker can be driven from tests.

pub mod node_mode;
pub mod worker;

pub use node_mode::{recover, register_node, run_node, served_queues};
pub use worker::{QueueWorker, TaskHandler, logging_handler};
