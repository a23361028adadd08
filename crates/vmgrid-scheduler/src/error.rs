//! Scheduler error types.

use thiserror::Error;

/// The resource a placement ran out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LowResource {
    #[error("No nodes with metrics")]
    NoHypervisors,

    #[error("No nodes with a reasonable queue length")]
    QueuesBacklogged,

    #[error("Requested vCPUs exceeds vCPU limit")]
    RequestedCpuExceedsLimit,

    #[error("No nodes with enough idle CPU")]
    InsufficientCpu,

    #[error("No nodes with enough idle RAM")]
    InsufficientRam,

    #[error("No nodes with enough disk space")]
    InsufficientDisk,
}

/// Errors that can occur while placing an instance.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("candidate node not found: {0}")]
    CandidateNodeNotFound(String),

    #[error("{0}")]
    LowResource(#[from] LowResource),

    #[error("cannot find network node with ip {0}")]
    NoNetworkNode(String),

    #[error("store error: {0}")]
    Store(#[from] vmgrid_store::StoreError),

    #[error("coordination error: {0}")]
    Coord(#[from] vmgrid_coord::CoordError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
