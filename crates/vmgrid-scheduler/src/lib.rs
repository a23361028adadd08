//! vmgrid-scheduler: instance placement.
//!
//! Chooses hypervisor nodes for a new instance from the metrics each
//! node publishes to the store. The scheduler:
//!
//! - Caches node metrics for a configurable time
//! - Filters nodes by hypervisor role, queue depth, CPU, RAM and disk
//! - Ranks survivors by tag affinity, then by load average
//! - Reports the candidate set after every stage through an audit hook
//! - Summarizes spare capacity per node and cluster wide
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   ├── KvStore (node, metrics, instance, networkinterface records)
//!   ├── StateCache (active nodes, healthy instances)
//!   ├── ResourcePolicy (overcommit ratios, reservations)
//!   └── AuditHook (per-stage candidate reports)
//! ```

pub mod audit;
pub mod error;
pub mod filters;
pub mod metrics;
pub mod records;
pub mod scheduler;
pub mod summary;

pub use audit::{AuditEvent, AuditHook, AuditLog, AuditSubject, tracing_hook};
pub use error::{LowResource, SchedulerError, SchedulerResult};
pub use filters::ResourcePolicy;
pub use metrics::{get_active_node_metrics, nodes_by_free_disk_descending};
pub use records::{
    DiskSpec, InstanceRecord, MetricsRecord, NetworkInterfaceRecord, NodeMetrics, NodeRecord, Placement,
};
pub use scheduler::Scheduler;
pub use summary::{ClusterSummary, ResourceSummary};
