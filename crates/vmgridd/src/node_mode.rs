//! Node mode: runs on every cluster member.
//!
//! In this mode, the daemon:
//! 1. Opens the shared store and registers this node as active
//! 2. Reclaims locks left behind by dead processes on this node
//! 3. Returns claimed but unfinished work items to their queues
//! 4. Runs a worker per queue this node serves, plus the stale lock sweeper
//! 5. On shutdown, stops the workers and sweeper

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};
use vmgrid_coord::{
    ALL_STATE, LiveQueue, LockManager, StaleLockSweeper, StateCache, WorkQueue, clear_stale_locks,
};
use vmgrid_core::{GridConfig, NETWORK_NODE_QUEUE};
use vmgrid_scheduler::NodeRecord;
use vmgrid_scheduler::records::{NODE_ACTIVE_STATE, node_key};
use vmgrid_store::KvStore;

use crate::worker::{QueueWorker, TaskHandler};

/// How often stale locks are swept after startup.
pub const STALE_LOCK_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Queues this node consumes.
pub fn served_queues(config: &GridConfig) -> Vec<String> {
    let mut queues = vec![config.node_name.clone()];
    if config.node_is_network_node {
        queues.push(NETWORK_NODE_QUEUE.to_string());
    }
    queues
}

/// Publish this node's record and move it to the active state.
pub async fn register_node(store: &KvStore, cache: &StateCache, config: &GridConfig) -> anyhow::Result<()> {
    store.put_json(
        &node_key(&config.node_name),
        &NodeRecord {
            fqdn: config.node_name.clone(),
            ip: config.node_mesh_ip.clone(),
        },
    )?;

    let states = cache.states_of("node", &config.node_name)?;
    if !states.contains(NODE_ACTIVE_STATE) {
        let old = states.iter().map(String::as_str).find(|s| *s != ALL_STATE);
        cache
            .update("node", &config.node_name, old, NODE_ACTIVE_STATE)
            .await?;
    }
    info!(node = %config.node_name, ip = %config.node_mesh_ip, "node registered");
    Ok(())
}

/// Startup recovery: stale locks first, then queue restarts.
///
/// Returns how many work items went back to their queues.
pub async fn recover(store: &KvStore, queue: &WorkQueue, config: &GridConfig) -> anyhow::Result<usize> {
    let cleared = clear_stale_locks(store, &config.node_name)?;
    if !cleared.is_empty() {
        warn!(node = %config.node_name, cleared = cleared.len(), "cleared stale locks at startup");
    }

    let reset = queue
        .restart_queues(&config.node_name, config.node_is_network_node)
        .await?;
    info!(node = %config.node_name, reset, "queues restarted");
    Ok(reset)
}

/// Run the node until `shutdown` fires.
pub async fn run_node(
    config: GridConfig,
    handler: TaskHandler,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!(node = %config.node_name, "vmgrid daemon starting in node mode");

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.store_path();
    let store = KvStore::open(&db_path)?;
    info!(path = ?db_path, "store opened");

    let locks = LockManager::from_config(store.clone(), &config);
    let cache = StateCache::new(locks.clone());
    let queue = WorkQueue::new(locks);

    register_node(&store, &cache, &config).await?;
    recover(&store, &queue, &config).await?;

    // ── Background tasks ─────────────────────────────────────────
    let sweeper = StaleLockSweeper::new(store.clone(), config.node_name.clone(), STALE_LOCK_SWEEP_INTERVAL);
    let sweeper_shutdown = shutdown.clone();
    let mut handles = vec![tokio::spawn(async move {
        sweeper.run(sweeper_shutdown).await;
    })];

    for name in served_queues(&config) {
        let worker = QueueWorker::new(LiveQueue::open(store.clone(), name)?, handler.clone())
            .with_poll_interval(config.lock_poll_interval());
        let worker_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            worker.run(worker_shutdown).await;
        }));
    }
    info!(tasks = handles.len(), "background tasks started");

    // Wait for background tasks.
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }

    info!(node = %config.node_name, "node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use vmgrid_coord::{LockManager, Task, WorkItem};

    use super::*;

    fn config(network_node: bool) -> GridConfig {
        GridConfig {
            node_name: "node01".to_string(),
            node_mesh_ip: "10.0.0.5".to_string(),
            node_is_network_node: network_node,
            ..Default::default()
        }
    }

    #[test]
    fn network_node_serves_shared_queue() {
        assert_eq!(served_queues(&config(false)), vec!["node01"]);
        assert_eq!(served_queues(&config(true)), vec!["node01", "networknode"]);
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let store = KvStore::open_in_memory().unwrap();
        let cache = StateCache::new(LockManager::new(store.clone(), "node01"));
        let config = config(false);

        cache.update("node", "node01", None, "deleted").await.unwrap();
        register_node(&store, &cache, &config).await.unwrap();
        register_node(&store, &cache, &config).await.unwrap();

        assert_eq!(
            cache.states_of("node", "node01").unwrap(),
            BTreeSet::from(["created".to_string()])
        );
        let record: NodeRecord = store.get_json(&node_key("node01")).unwrap().unwrap();
        assert_eq!(record.ip, "10.0.0.5");
    }

    #[tokio::test]
    async fn recover_requeues_claimed_items() {
        let store = KvStore::open_in_memory().unwrap();
        let queue = WorkQueue::new(LockManager::new(store.clone(), "node01"));
        let item = WorkItem::single(Task::NetworkDeploy {
            network_uuid: "net1".to_string(),
        })
        .unwrap();
        queue.enqueue("node01", &item, Duration::ZERO).await.unwrap();
        queue.enqueue("networknode", &item, Duration::ZERO).await.unwrap();
        queue.dequeue("node01").await.unwrap().unwrap();
        queue.dequeue("networknode").await.unwrap().unwrap();

        assert_eq!(recover(&store, &queue, &config(false)).await.unwrap(), 1);
        assert_eq!(recover(&store, &queue, &config(true)).await.unwrap(), 1);
        assert_eq!(recover(&store, &queue, &config(true)).await.unwrap(), 0);
        assert_eq!(queue.get_queue_length("networknode").unwrap().processing, 0);
    }
}
