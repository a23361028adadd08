//! Store records the scheduler reads.
//!
//! ```text
//! /sf/node/<fqdn>                {fqdn, ip}
//! /sf/metrics/<fqdn>/            {metrics: {...}, timestamp}
//! /sf/instance/<uuid>            instance placement inputs
//! /sf/networkinterface/<uuid>    {uuid, network_uuid, instance_uuid}
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;
use vmgrid_coord::StateCache;
use vmgrid_store::{KvStore, StoreResult, construct_key, decode, last_segment};

use crate::error::SchedulerResult;

/// Node state whose members are eligible for scheduling.
pub const NODE_ACTIVE_STATE: &str = "created";

/// Instance states that count towards affinity.
pub const HEALTHY_INSTANCE_STATES: &[&str] = &["initial", "preflight", "creating", "created"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub fqdn: String,
    pub ip: String,
}

/// Facts a node publishes about itself. Absent fields read as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeMetrics {
    pub cpu_max: u64,
    pub cpu_max_per_instance: u64,
    pub cpu_total_instance_vcpus: u64,
    pub cpu_load_1: f64,
    /// MB.
    pub memory_available: f64,
    /// MB.
    pub memory_max: f64,
    /// MB.
    pub memory_total_instance_actual: f64,
    /// Bytes.
    #[serde(deserialize_with = "lenient_u64")]
    pub disk_free: u64,
    /// Bytes free on the instance volume.
    #[serde(deserialize_with = "lenient_u64")]
    pub disk_free_instances: u64,
    pub instances_total: u64,
    pub instances_active: u64,
    pub queue_waiting: u64,
    pub is_hypervisor: bool,
    /// Metrics this version has no field for.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl NodeMetrics {
    /// Free disk in bytes for a named use (`None` → whole node).
    pub fn disk_free_for(&self, intention: Option<&str>) -> u64 {
        match intention {
            None => self.disk_free,
            Some("instances") => self.disk_free_instances,
            Some(other) => self
                .extra
                .get(&format!("disk_free_{other}"))
                .and_then(value_as_u64)
                .unwrap_or(0),
        }
    }
}

fn value_as_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Byte counts are published as either numbers or numeric strings.
fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(0);
    }
    value_as_u64(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("expected a byte count, got {value}")))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    #[serde(default)]
    pub metrics: NodeMetrics,
    #[serde(default)]
    pub timestamp: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    #[serde(default)]
    pub base: Option<String>,
    /// GB. Sizeless disks take the size of their base image.
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub bus: Option<String>,
    #[serde(default, rename = "type")]
    pub disk_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub uuid: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub cpus: u64,
    /// MB.
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub disk_spec: Vec<DiskSpec>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Tag → weight; negative weights repel.
    #[serde(default)]
    pub affinity: BTreeMap<String, i64>,
    #[serde(default)]
    pub placement: Placement,
    /// Network interface uuids.
    #[serde(default)]
    pub interfaces: Vec<String>,
}

impl InstanceRecord {
    pub fn node(&self) -> Option<&str> {
        self.placement.node.as_deref().filter(|n| !n.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceRecord {
    pub uuid: String,
    pub network_uuid: String,
    #[serde(default)]
    pub instance_uuid: Option<String>,
}

pub fn node_key(fqdn: &str) -> String {
    construct_key("node", "", fqdn)
}

pub fn metrics_key(fqdn: &str) -> String {
    construct_key("metrics", fqdn, "")
}

pub fn instance_key(uuid: &str) -> String {
    construct_key("instance", "", uuid)
}

pub fn interface_key(uuid: &str) -> String {
    construct_key("networkinterface", "", uuid)
}

/// FQDNs of nodes in the active state.
pub fn active_node_names(cache: &StateCache) -> SchedulerResult<Vec<String>> {
    Ok(cache.read("node", NODE_ACTIVE_STATE)?.into_keys().collect())
}

/// Records of active nodes. Active nodes without a record are skipped.
pub fn active_nodes(store: &KvStore, cache: &StateCache) -> SchedulerResult<Vec<NodeRecord>> {
    let mut nodes = Vec::new();
    for fqdn in active_node_names(cache)? {
        match store.get_json::<NodeRecord>(&node_key(&fqdn))? {
            Some(node) => nodes.push(node),
            None => warn!(node = %fqdn, "active node has no node record"),
        }
    }
    Ok(nodes)
}

pub fn read_metrics(store: &KvStore, fqdn: &str) -> StoreResult<Option<MetricsRecord>> {
    store.get_json(&metrics_key(fqdn))
}

pub fn get_instance(store: &KvStore, uuid: &str) -> StoreResult<Option<InstanceRecord>> {
    store.get_json(&instance_key(uuid))
}

/// Every instance record. Malformed records are logged and skipped.
pub fn all_instances(store: &KvStore) -> StoreResult<Vec<InstanceRecord>> {
    let mut instances = Vec::new();
    for (key, bytes) in store.get_prefix(&construct_key("instance", "", ""), 0)? {
        match decode::<InstanceRecord>(&key, &bytes) {
            Ok(inst) => instances.push(inst),
            Err(e) => warn!(instance = %last_segment(&key), error = %e, "skipping malformed instance record"),
        }
    }
    Ok(instances)
}

/// Instances in a healthy state, found through the state cache.
pub fn healthy_instances(store: &KvStore, cache: &StateCache) -> SchedulerResult<Vec<InstanceRecord>> {
    let mut instances = Vec::new();
    for uuid in cache.read_many("instance", HEALTHY_INSTANCE_STATES)? {
        match get_instance(store, &uuid) {
            Ok(Some(inst)) => instances.push(inst),
            Ok(None) => warn!(instance = %uuid, "healthy instance has no record"),
            Err(e) => warn!(instance = %uuid, error = %e, "skipping unreadable instance record"),
        }
    }
    Ok(instances)
}

pub fn get_interface(store: &KvStore, uuid: &str) -> StoreResult<Option<NetworkInterfaceRecord>> {
    store.get_json(&interface_key(uuid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_metrics_read_as_zero() {
        let metrics: NodeMetrics = serde_json::from_value(json!({"cpu_max": 4})).unwrap();
        assert_eq!(metrics.cpu_max, 4);
        assert_eq!(metrics.memory_max, 0.0);
        assert!(!metrics.is_hypervisor);
    }

    #[test]
    fn disk_counts_accept_strings() {
        let metrics: NodeMetrics = serde_json::from_value(json!({
            "disk_free": "2048",
            "disk_free_instances": 1024,
            "disk_free_uploads": "512",
        }))
        .unwrap();
        assert_eq!(metrics.disk_free_for(None), 2048);
        assert_eq!(metrics.disk_free_for(Some("instances")), 1024);
        assert_eq!(metrics.disk_free_for(Some("uploads")), 512);
        assert_eq!(metrics.disk_free_for(Some("nothing")), 0);
    }

    #[test]
    fn instance_record_defaults() {
        let inst: InstanceRecord = serde_json::from_value(json!({
            "uuid": "abc",
            "cpus": 2,
            "memory": 2048,
            "disk_spec": [{"base": "debian:12", "size": 20}, {"base": "cirros", "type": "cdrom"}],
            "placement": {"node": "sf-1"},
        }))
        .unwrap();
        assert_eq!(inst.node(), Some("sf-1"));
        assert_eq!(inst.disk_spec[1].size, None);
        assert_eq!(inst.disk_spec[1].disk_type.as_deref(), Some("cdrom"));
        assert!(inst.affinity.is_empty());
    }

    #[test]
    fn key_layout() {
        assert_eq!(node_key("sf-1"), "/sf/node/sf-1");
        assert_eq!(metrics_key("sf-1"), "/sf/metrics/sf-1/");
        assert_eq!(instance_key("abc"), "/sf/instance/abc");
        assert_eq!(interface_key("ni"), "/sf/networkinterface/ni");
    }
}
