//! vmgrid-core: shared configuration, identifiers, and helpers.
//!
//! Every daemon in the cluster loads a [`GridConfig`] at startup. The
//! coordination and scheduling crates take the values they need from it
//! explicitly rather than reading process-wide state.

pub mod config;
pub mod types;

pub use config::GridConfig;
pub use types::*;
