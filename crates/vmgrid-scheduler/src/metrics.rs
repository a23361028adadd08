//! Fetching the metrics active nodes publish.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};
use vmgrid_coord::StateCache;
use vmgrid_core::GIB;
use vmgrid_store::KvStore;

use crate::audit::{AuditEvent, AuditHook, AuditSubject};
use crate::error::SchedulerResult;
use crate::records::{MetricsRecord, NodeMetrics, active_node_names, read_metrics};

/// Read one node's metrics off the async runtime, giving up after
/// `timeout`. `Ok(None)` means the node has published nothing.
async fn fetch_node_metrics(
    store: &KvStore,
    fqdn: &str,
    timeout: Duration,
) -> Result<Option<MetricsRecord>, String> {
    let store = store.clone();
    let node = fqdn.to_string();
    let read = tokio::task::spawn_blocking(move || read_metrics(&store, &node));

    match tokio::time::timeout(timeout, read).await {
        Ok(Ok(Ok(record))) => Ok(record),
        Ok(Ok(Err(e))) => Err(e.to_string()),
        Ok(Err(e)) => Err(format!("metrics read task failed: {e}")),
        Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
    }
}

/// Metrics for every active node.
///
/// A node with no published metrics maps to empty metrics. A node whose
/// read fails or times out is reported through `audit` and left out.
pub async fn get_active_node_metrics(
    store: &KvStore,
    cache: &StateCache,
    timeout: Duration,
    scheduler: &str,
    audit: &AuditHook,
) -> SchedulerResult<BTreeMap<String, NodeMetrics>> {
    let mut metrics = BTreeMap::new();

    for fqdn in active_node_names(cache)? {
        match fetch_node_metrics(store, &fqdn, timeout).await {
            Ok(Some(record)) => {
                metrics.insert(fqdn, record.metrics);
            }
            Ok(None) => {
                audit(&AuditEvent {
                    scheduler: scheduler.to_string(),
                    subject: AuditSubject::node(&fqdn),
                    message: "empty metrics from database for node".to_string(),
                    extra: json!({}),
                });
                metrics.insert(fqdn, NodeMetrics::default());
            }
            Err(error) => {
                warn!(node = %fqdn, %error, "refreshing metrics for node failed");
                audit(&AuditEvent {
                    scheduler: scheduler.to_string(),
                    subject: AuditSubject::node(&fqdn),
                    message: "refreshing metrics for node failed".to_string(),
                    extra: json!({ "error": error }),
                });
            }
        }
    }

    debug!(nodes = metrics.len(), "fetched active node metrics");
    Ok(metrics)
}

/// Active nodes ordered by free disk, most first. `minimum` and `maximum`
/// bound the free GB; `intention` selects which disk metric is used.
pub fn nodes_by_free_disk_descending(
    store: &KvStore,
    cache: &StateCache,
    minimum: u64,
    maximum: Option<u64>,
    intention: Option<&str>,
) -> SchedulerResult<Vec<String>> {
    let mut by_disk: BTreeMap<u64, Vec<String>> = BTreeMap::new();

    for fqdn in active_node_names(cache)? {
        let metrics = read_metrics(store, &fqdn)?.map(|r| r.metrics).unwrap_or_default();
        let disk_free_gb = metrics.disk_free_for(intention) / GIB;

        if disk_free_gb < minimum {
            continue;
        }
        if maximum.is_some_and(|max| disk_free_gb > max) {
            continue;
        }
        by_disk.entry(disk_free_gb).or_default().push(fqdn);
    }

    Ok(by_disk.into_values().rev().flatten().collect())
}
