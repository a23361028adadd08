//! Cluster capacity summary.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::filters::ResourcePolicy;
use crate::records::NodeMetrics;

/// Capacity left on one node, or across the cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceSummary {
    /// vCPUs that could still be allocated.
    pub cpu_available: u64,
    pub ram_available_mb: u64,
    pub disk_available_gb: u64,
    pub instances_total: u64,
    pub instances_active: u64,
    pub is_hypervisor: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusterSummary {
    /// Totals over hypervisor nodes.
    pub cluster: ResourceSummary,
    pub nodes: BTreeMap<String, ResourceSummary>,
}

fn clamp(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.floor() as u64
    } else {
        0
    }
}

pub fn summarize_node(policy: &ResourcePolicy, metrics: &NodeMetrics) -> ResourceSummary {
    let cpu = policy.hard_max_cpus(metrics) - metrics.cpu_total_instance_vcpus as f64;
    let ram = policy
        .ram_after_reservation(metrics)
        .min(policy.ram_before_overcommit(metrics));

    ResourceSummary {
        cpu_available: clamp(cpu),
        ram_available_mb: clamp(ram),
        disk_available_gb: clamp(policy.usable_disk_gb(metrics)),
        instances_total: metrics.instances_total,
        instances_active: metrics.instances_active,
        is_hypervisor: metrics.is_hypervisor,
    }
}

pub fn summarize(policy: &ResourcePolicy, metrics: &BTreeMap<String, NodeMetrics>) -> ClusterSummary {
    let mut summary = ClusterSummary::default();
    summary.cluster.is_hypervisor = true;

    for (node, m) in metrics {
        let node_summary = summarize_node(policy, m);
        if node_summary.is_hypervisor {
            let c = &mut summary.cluster;
            c.cpu_available += node_summary.cpu_available;
            c.ram_available_mb += node_summary.ram_available_mb;
            c.disk_available_gb += node_summary.disk_available_gb;
            c.instances_total += node_summary.instances_total;
            c.instances_active += node_summary.instances_active;
        }
        summary.nodes.insert(node.clone(), node_summary);
    }
    summary
}
