//! redb table definitions.
//!
//! The whole key space lives in one table so that prefix scans and
//! multi-key batches cover every object type uniformly.

use redb::TableDefinition;

/// Every key in the cluster, `&str` path to JSON bytes.
pub const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
