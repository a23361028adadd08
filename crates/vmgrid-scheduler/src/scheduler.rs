//! Scheduler: picks the nodes an instance may be placed on.
//!
//! One `Scheduler` owns a TTL cache of node metrics and the resolved
//! network node. `find_candidates` runs a fixed pipeline of filters over
//! the candidate set, reporting the set after every stage:
//!
//! ```text
//! forced → initial → hypervisor → queue → cpu limit → idle cpu
//!        → idle ram → idle disk → affinity → load → shuffle
//! ```
//!
//! Hard requirement stages fail with a [`LowResource`] reason when they
//! leave no candidates.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use serde_json::json;
use tracing::{debug, error, info};
use vmgrid_coord::StateCache;
use vmgrid_core::GridConfig;
use vmgrid_store::KvStore;

use crate::audit::{AuditEvent, AuditHook, AuditSubject, tracing_hook};
use crate::error::{LowResource, SchedulerError, SchedulerResult};
use crate::filters::{self, ResourcePolicy};
use crate::metrics::get_active_node_metrics;
use crate::records::{self, InstanceRecord, NodeMetrics, NodeRecord};
use crate::summary::{self, ClusterSummary};

pub struct Scheduler {
    /// Distinguishes this scheduler's audit events.
    id: String,
    store: KvStore,
    cache: StateCache,
    policy: ResourcePolicy,
    cache_timeout: Duration,
    metrics_fetch_timeout: Duration,
    network_node_ip: String,
    metrics: BTreeMap<String, NodeMetrics>,
    metrics_updated: Option<Instant>,
    network_node: Option<NodeRecord>,
    audit: AuditHook,
}

impl Scheduler {
    pub fn new(store: KvStore, cache: StateCache, config: &GridConfig) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            store,
            cache,
            policy: ResourcePolicy::from(config),
            cache_timeout: config.scheduler_cache_timeout(),
            metrics_fetch_timeout: config.metrics_fetch_timeout(),
            network_node_ip: config.network_node_ip.clone(),
            metrics: BTreeMap::new(),
            metrics_updated: None,
            network_node: None,
            audit: tracing_hook(),
        }
    }

    pub fn with_audit_hook(mut self, hook: AuditHook) -> Self {
        self.audit = hook;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn policy(&self) -> &ResourcePolicy {
        &self.policy
    }

    /// Metrics as of the last refresh.
    pub fn metrics(&self) -> &BTreeMap<String, NodeMetrics> {
        &self.metrics
    }

    fn emit(&self, subject: AuditSubject, message: &str, extra: serde_json::Value) {
        (self.audit)(&AuditEvent {
            scheduler: self.id.clone(),
            subject,
            message: message.to_string(),
            extra,
        });
    }

    fn emit_candidates(&self, inst: &InstanceRecord, message: &str, candidates: &[String]) {
        self.emit(
            AuditSubject::instance(&inst.uuid),
            message,
            json!({ "candidates": candidates }),
        );
    }

    /// Re-fetch metrics for every active node.
    pub async fn refresh_metrics(&mut self) -> SchedulerResult<()> {
        self.metrics = get_active_node_metrics(
            &self.store,
            &self.cache,
            self.metrics_fetch_timeout,
            &self.id,
            &self.audit,
        )
        .await?;
        self.metrics_updated = Some(Instant::now());
        Ok(())
    }

    /// Refresh if the cache is older than the timeout or empty.
    async fn ensure_fresh_metrics(&mut self) -> SchedulerResult<()> {
        let age = self.metrics_updated.map(|t| t.elapsed());
        debug!(
            scheduler = %self.id,
            age_secs = age.map(|a| a.as_secs_f64()),
            max_secs = self.cache_timeout.as_secs_f64(),
            cached_nodes = self.metrics.len(),
            "checking metrics cache"
        );
        if age.is_none_or(|a| a > self.cache_timeout) || self.metrics.is_empty() {
            self.refresh_metrics().await?;
            debug!(scheduler = %self.id, cached_nodes = self.metrics.len(), "metrics refreshed");
        }
        Ok(())
    }

    /// Drop candidates failing `keep`, reporting the survivors.
    fn narrow(
        &self,
        inst: &InstanceRecord,
        candidates: &mut Vec<String>,
        message: &str,
        keep: impl Fn(&str, &NodeMetrics) -> bool,
    ) {
        candidates.retain(|n| self.metrics.get(n).is_some_and(|m| keep(n, m)));
        self.emit_candidates(inst, message, candidates);
    }

    /// Nodes `inst` may be placed on, best first in random order.
    ///
    /// `forced` restricts scheduling to the given nodes, each of which
    /// must have metrics. `requested_networks` is recorded for audit.
    pub async fn find_candidates(
        &mut self,
        inst: &InstanceRecord,
        requested_networks: &[String],
        forced: Option<&[String]>,
    ) -> SchedulerResult<Vec<String>> {
        self.ensure_fresh_metrics().await?;

        if !requested_networks.is_empty() {
            self.emit(
                AuditSubject::instance(&inst.uuid),
                "schedule requested networks",
                json!({ "networks": requested_networks }),
            );
        }

        let mut candidates: Vec<String> = match forced {
            Some(forced) if !forced.is_empty() => {
                self.emit_candidates(inst, "schedule forced candidates", forced);
                if let Some(missing) = forced.iter().find(|n| !self.metrics.contains_key(*n)) {
                    return Err(SchedulerError::CandidateNodeNotFound(missing.clone()));
                }
                forced.to_vec()
            }
            _ => self.metrics.keys().cloned().collect(),
        };
        self.emit_candidates(inst, "schedule initial candidates", &candidates);

        self.narrow(inst, &mut candidates, "schedule are hypervisors", |_, m| {
            filters::is_hypervisor(m)
        });
        if candidates.is_empty() {
            return Err(LowResource::NoHypervisors.into());
        }

        let policy = &self.policy;
        self.narrow(inst, &mut candidates, "schedule reasonable queue state", |n, m| {
            filters::has_reasonable_queue(policy, n, m)
        });
        if candidates.is_empty() {
            return Err(LowResource::QueuesBacklogged.into());
        }

        self.narrow(inst, &mut candidates, "schedule have enough actual cpu", |_, m| {
            filters::within_cpu_limit(inst.cpus, m)
        });
        if candidates.is_empty() {
            return Err(LowResource::RequestedCpuExceedsLimit.into());
        }

        self.narrow(inst, &mut candidates, "schedule have enough idle cpu", |n, m| {
            filters::has_sufficient_cpu(policy, n, inst.cpus, m)
        });
        if candidates.is_empty() {
            return Err(LowResource::InsufficientCpu.into());
        }

        self.narrow(inst, &mut candidates, "schedule have enough idle ram", |n, m| {
            filters::has_sufficient_ram(policy, n, inst.memory, m)
        });
        if candidates.is_empty() {
            return Err(LowResource::InsufficientRam.into());
        }

        let requested_gb = filters::requested_disk_gb(&inst.disk_spec);
        self.narrow(inst, &mut candidates, "schedule have enough idle disk", |n, m| {
            filters::has_sufficient_disk(policy, n, requested_gb, m)
        });
        if candidates.is_empty() {
            return Err(LowResource::InsufficientDisk.into());
        }

        if !inst.affinity.is_empty() {
            let placed = records::healthy_instances(&self.store, &self.cache)?;
            let scores = filters::affinity_scores(inst, &candidates, &placed);
            self.emit(
                AuditSubject::instance(&inst.uuid),
                "schedule affinity scores",
                json!({ "scores": scores }),
            );
            candidates = filters::keep_best(&candidates, |n| scores.get(n).copied().unwrap_or(0));
            self.emit_candidates(inst, "schedule have best affinity", &candidates);
        }

        candidates = filters::keep_best(&candidates, |n| {
            // Lowest load ranks highest.
            -self.metrics.get(n).map(filters::load_rank).unwrap_or(0)
        });
        self.emit_candidates(inst, "schedule have lowest cpu load", &candidates);

        candidates.shuffle(&mut rand::rng());
        self.emit_candidates(inst, "schedule final candidates", &candidates);
        info!(
            scheduler = %self.id,
            instance = %inst.uuid,
            candidates = ?candidates,
            "scheduling complete"
        );
        Ok(candidates)
    }

    /// The node whose ip is the configured network node ip. Cached once
    /// found.
    pub fn get_network_node(&mut self) -> SchedulerResult<NodeRecord> {
        if let Some(node) = &self.network_node {
            return Ok(node.clone());
        }

        let found = records::active_nodes(&self.store, &self.cache)?
            .into_iter()
            .find(|n| n.ip == self.network_node_ip);
        match found {
            Some(node) => {
                self.network_node = Some(node.clone());
                Ok(node)
            }
            None => Err(SchedulerError::NoNetworkNode(self.network_node_ip.clone())),
        }
    }

    /// Candidates already hosting the most of `requested_networks`.
    ///
    /// The network node has every network, so when it is the only node
    /// with any matches the signal is ignored and every candidate is kept.
    pub fn find_most_matching_networks(
        &mut self,
        requested_networks: &[String],
        candidates: &[String],
    ) -> SchedulerResult<Vec<String>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut per_node: BTreeMap<String, Vec<InstanceRecord>> = BTreeMap::new();
        for inst in records::all_instances(&self.store)? {
            if let Some(node) = inst.node() {
                per_node.entry(node.to_string()).or_default().push(inst);
            }
        }

        let mut matches: BTreeMap<&str, usize> = BTreeMap::new();
        for node in candidates {
            let mut present: BTreeSet<String> = BTreeSet::new();
            for inst in per_node.get(node).into_iter().flatten() {
                for iface in &inst.interfaces {
                    match records::get_interface(&self.store, iface)? {
                        Some(ni) => {
                            present.insert(ni.network_uuid);
                        }
                        None => error!(
                            instance = %inst.uuid,
                            networkinterface = %iface,
                            "interface missing while attempting schedule"
                        ),
                    }
                }
            }
            let count = present
                .iter()
                .filter(|net| requested_networks.contains(net))
                .count();
            matches.insert(node.as_str(), count);
        }

        let max_matches = matches.values().copied().max().unwrap_or(0);
        if max_matches == 0 {
            return Ok(candidates.to_vec());
        }

        let with_matches: Vec<&str> = matches
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(node, _)| *node)
            .collect();
        if let [only] = with_matches.as_slice() {
            let network_node = self.get_network_node()?;
            if *only == network_node.fqdn {
                return Ok(candidates.to_vec());
            }
        }

        Ok(candidates
            .iter()
            .filter(|n| matches.get(n.as_str()) == Some(&max_matches))
            .cloned()
            .collect())
    }

    /// Capacity left per node and across hypervisors.
    pub async fn summarize_resources(&mut self) -> SchedulerResult<ClusterSummary> {
        self.ensure_fresh_metrics().await?;
        Ok(summary::summarize(&self.policy, &self.metrics))
    }
}
