//! Capacity checks and ranking stages.
//!
//! Every function here is pure: it takes a node's published metrics (or
//! the candidate set) and the overcommit policy and decides. The
//! [`Scheduler`](crate::Scheduler) strings them into the pipeline.

use std::collections::BTreeMap;

use tracing::debug;
use vmgrid_core::{GIB, GridConfig};

use crate::records::{DiskSpec, InstanceRecord, NodeMetrics};

/// Overcommit ratios and reservations applied to every node.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePolicy {
    pub cpu_overcommit_ratio: f64,
    pub ram_overcommit_ratio: f64,
    /// GB kept back for the host operating system.
    pub ram_system_reservation: f64,
    /// GB of instance disk that must stay free.
    pub minimum_free_disk: u64,
    pub max_queue_waiting: u64,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self::from(&GridConfig::default())
    }
}

impl From<&GridConfig> for ResourcePolicy {
    fn from(config: &GridConfig) -> Self {
        Self {
            cpu_overcommit_ratio: config.cpu_overcommit_ratio,
            ram_overcommit_ratio: config.ram_overcommit_ratio,
            ram_system_reservation: config.ram_system_reservation,
            minimum_free_disk: config.minimum_free_disk,
            max_queue_waiting: config.max_queue_waiting,
        }
    }
}

impl ResourcePolicy {
    /// vCPUs the node may host in total.
    pub fn hard_max_cpus(&self, metrics: &NodeMetrics) -> f64 {
        metrics.cpu_max as f64 * self.cpu_overcommit_ratio
    }

    /// MB left after the system reservation.
    pub fn ram_after_reservation(&self, metrics: &NodeMetrics) -> f64 {
        metrics.memory_available - self.ram_system_reservation * 1024.0
    }

    /// MB of instance memory the node may still take before exceeding
    /// the overcommit ratio.
    pub fn ram_before_overcommit(&self, metrics: &NodeMetrics) -> f64 {
        metrics.memory_max * self.ram_overcommit_ratio - metrics.memory_total_instance_actual
    }

    /// GB of instance disk available for new disks.
    pub fn usable_disk_gb(&self, metrics: &NodeMetrics) -> f64 {
        metrics.disk_free_instances as f64 / GIB as f64 - self.minimum_free_disk as f64
    }
}

pub fn is_hypervisor(metrics: &NodeMetrics) -> bool {
    metrics.is_hypervisor
}

pub fn has_reasonable_queue(policy: &ResourcePolicy, node: &str, metrics: &NodeMetrics) -> bool {
    if metrics.queue_waiting > policy.max_queue_waiting {
        debug!(
            node,
            queue_waiting = metrics.queue_waiting,
            max_queue_waiting = policy.max_queue_waiting,
            "node has too many waiting workitems"
        );
        return false;
    }
    true
}

pub fn within_cpu_limit(cpus: u64, metrics: &NodeMetrics) -> bool {
    cpus <= metrics.cpu_max_per_instance
}

pub fn has_sufficient_cpu(policy: &ResourcePolicy, node: &str, cpus: u64, metrics: &NodeMetrics) -> bool {
    let hard_max_cpus = policy.hard_max_cpus(metrics);
    let current_cpus = metrics.cpu_total_instance_vcpus;

    if (current_cpus + cpus) as f64 > hard_max_cpus {
        debug!(
            node,
            current_cpus,
            requested_cpus = cpus,
            hard_max_cpus,
            "scheduling on node would exceed hard maximum CPUs"
        );
        return false;
    }
    true
}

/// `memory` is in MB.
pub fn has_sufficient_ram(policy: &ResourcePolicy, node: &str, memory: u64, metrics: &NodeMetrics) -> bool {
    let memory = memory as f64;

    let available = policy.ram_after_reservation(metrics);
    if available - memory < 0.0 {
        debug!(node, available, requested_memory = memory, "insufficient memory");
        return false;
    }

    let instance_memory = metrics.memory_total_instance_actual + memory;
    if metrics.memory_max <= 0.0 || instance_memory / metrics.memory_max > policy.ram_overcommit_ratio {
        debug!(
            node,
            instance_memory,
            memory_max = metrics.memory_max,
            overcommit_ratio = policy.ram_overcommit_ratio,
            "memory overcommit ratio exceeded"
        );
        return false;
    }
    true
}

/// GB requested by disks that declare a size. Sizeless disks match their
/// base image and are not counted.
pub fn requested_disk_gb(disk_spec: &[DiskSpec]) -> u64 {
    disk_spec.iter().filter_map(|disk| disk.size).sum()
}

pub fn has_sufficient_disk(policy: &ResourcePolicy, node: &str, requested_gb: u64, metrics: &NodeMetrics) -> bool {
    let disk_free_gb = policy.usable_disk_gb(metrics);
    if requested_gb as f64 > disk_free_gb {
        debug!(
            node,
            requested_disk_gb = requested_gb,
            disk_free_gb,
            "node has insufficient disk"
        );
        return false;
    }
    true
}

/// Affinity score of each candidate for `inst`.
///
/// Each other instance on a candidate, in the same namespace, adds the
/// weight of every requested tag it carries.
pub fn affinity_scores(
    inst: &InstanceRecord,
    candidates: &[String],
    placed: &[InstanceRecord],
) -> BTreeMap<String, i64> {
    let mut scores: BTreeMap<String, i64> = candidates.iter().map(|n| (n.clone(), 0)).collect();

    for other in placed {
        if other.uuid == inst.uuid || other.namespace != inst.namespace {
            continue;
        }
        let Some(score) = other.node().and_then(|node| scores.get_mut(node)) else {
            continue;
        };
        for (tag, weight) in &inst.affinity {
            if other.tags.contains(tag) {
                *score += weight;
            }
        }
    }
    scores
}

/// Candidates whose score equals the highest score. Ties keep every
/// tied node, in candidate order.
pub fn keep_best<T: Ord + Copy>(candidates: &[String], score: impl Fn(&str) -> T) -> Vec<String> {
    let Some(best) = candidates.iter().map(|n| score(n.as_str())).max() else {
        return Vec::new();
    };
    candidates
        .iter()
        .filter(|n| score(n.as_str()) == best)
        .cloned()
        .collect()
}

/// Floor of the one minute load average, used for ranking.
pub fn load_rank(metrics: &NodeMetrics) -> i64 {
    metrics.cpu_load_1.floor() as i64
}
