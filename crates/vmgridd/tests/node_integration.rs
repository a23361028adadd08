//! Multi-daemon integration tests.
//!
//! Several "daemons" share one store, each with its own lock manager
//! identity, the way separate processes on separate nodes share the
//! cluster store. Everything runs in-process.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Notify, watch};
use vmgrid_coord::{CoordError, LockManager, StateCache, Task, WorkItem, WorkQueue};
use vmgrid_core::{GIB, GridConfig};
use vmgrid_scheduler::records::metrics_key;
use vmgrid_scheduler::{InstanceRecord, LowResource, Scheduler, SchedulerError};
use vmgrid_store::{KvStore, lock_key};
use vmgridd::{TaskHandler, recover, register_node, run_node};

fn daemon(store: &KvStore, node: &str) -> LockManager {
    LockManager::new(store.clone(), node)
        .with_poll_interval(Duration::from_millis(5))
        .with_timeout(Duration::from_secs(5))
}

fn preflight(uuid: &str) -> WorkItem {
    WorkItem::single(Task::InstancePreflight {
        instance_uuid: uuid.to_string(),
        network: Vec::new(),
    })
    .unwrap()
}

fn node_config(name: &str, ip: &str, data_dir: &Path) -> GridConfig {
    GridConfig {
        node_name: name.to_string(),
        node_mesh_ip: ip.to_string(),
        network_node_ip: "10.0.0.1".to_string(),
        data_dir: data_dir.to_path_buf(),
        lock_poll_interval_ms: 10,
        ..Default::default()
    }
}

/// A lingering handle can hold the database open briefly after shutdown.
async fn reopen(path: &Path) -> KvStore {
    for _ in 0..100 {
        if let Ok(store) = KvStore::open(path) {
            return store;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("store at {path:?} never became available");
}

#[tokio::test]
async fn queue_is_fifo_by_deadline() {
    let store = KvStore::open_in_memory().unwrap();
    let queue = WorkQueue::new(daemon(&store, "node01"));

    for uuid in ["first", "second", "third"] {
        queue.enqueue("node01", &preflight(uuid), Duration::ZERO).await.unwrap();
    }
    // Delayed work waits behind everything already due.
    queue
        .enqueue("node01", &preflight("later"), Duration::from_secs(3600))
        .await
        .unwrap();

    let mut order = Vec::new();
    while let Some((jobname, item)) = queue.dequeue("node01").await.unwrap() {
        order.push(item.instance_uuid().unwrap().to_string());
        queue.resolve("node01", &jobname).await.unwrap();
    }
    assert_eq!(order, vec!["first", "second", "third"]);

    let length = queue.get_queue_length("node01").unwrap();
    assert_eq!((length.processing, length.queued, length.deferred), (0, 0, 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dequeue_hands_each_item_out_once() {
    let store = KvStore::open_in_memory().unwrap();
    let producer = WorkQueue::new(daemon(&store, "producer"));
    for i in 0..40 {
        producer
            .enqueue("shared", &preflight(&format!("inst-{i:02}")), Duration::ZERO)
            .await
            .unwrap();
    }

    let mut consumers = Vec::new();
    for d in 0..4 {
        let queue = WorkQueue::new(daemon(&store, &format!("daemon{d}")));
        consumers.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some((_, item)) = queue.dequeue("shared").await.unwrap() {
                seen.push(item.instance_uuid().unwrap().to_string());
            }
            seen
        }));
    }

    let mut all = Vec::new();
    for consumer in consumers {
        all.extend(consumer.await.unwrap());
    }
    let unique: BTreeSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 40);
    assert_eq!(unique.len(), 40);
    assert_eq!(producer.get_queue_length("shared").unwrap().processing, 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn locks_exclude_across_daemons() {
    let store = KvStore::open_in_memory().unwrap();
    let inside = Arc::new(Mutex::new(0usize));
    let max_inside = Arc::new(Mutex::new(0usize));

    let mut tasks = Vec::new();
    for d in 0..3 {
        let locks = daemon(&store, &format!("daemon{d}"));
        let inside = inside.clone();
        let max_inside = max_inside.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                let guard = locks.acquire("instance", "", "shared", "test").await.unwrap();
                {
                    let mut n = inside.lock().unwrap();
                    *n += 1;
                    let mut max = max_inside.lock().unwrap();
                    *max = (*max).max(*n);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
                *inside.lock().unwrap() -= 1;
                guard.release().unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(*max_inside.lock().unwrap(), 1);
    assert!(store.get(&lock_key("/sf/instance/shared")).unwrap().is_none());
}

#[tokio::test]
async fn lock_times_out_while_held_elsewhere() {
    let store = KvStore::open_in_memory().unwrap();
    let _held = daemon(&store, "node01").acquire("network", "", "net1", "deploy").await.unwrap();

    let err = daemon(&store, "node02")
        .with_timeout(Duration::from_millis(50))
        .acquire("network", "", "net1", "deploy")
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::LockTimeout { .. }));
}

#[tokio::test]
async fn startup_reclaims_dead_holders_and_requeues() {
    let store = KvStore::open_in_memory().unwrap();
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = child.id();
    child.wait().unwrap();

    // A previous incarnation of the daemon claimed work and died holding
    // the queue lock.
    let previous = WorkQueue::new(daemon(&store, "node01").with_pid(dead_pid));
    previous.enqueue("node01", &preflight("inst-1"), Duration::ZERO).await.unwrap();
    previous.dequeue("node01").await.unwrap().unwrap();
    let stale = daemon(&store, "node01")
        .with_pid(dead_pid)
        .acquire("queue", "", "node01", "dequeue")
        .await
        .unwrap();
    std::mem::forget(stale);

    let config = GridConfig {
        node_name: "node01".to_string(),
        ..Default::default()
    };
    let fresh = WorkQueue::new(daemon(&store, "node01").with_timeout(Duration::from_millis(200)));
    assert_eq!(recover(&store, &fresh, &config).await.unwrap(), 1);

    let (_, item) = fresh.dequeue("node01").await.unwrap().unwrap();
    assert_eq!(item.instance_uuid(), Some("inst-1"));
}

#[tokio::test]
async fn state_cache_tracks_transitions() {
    let store = KvStore::open_in_memory().unwrap();
    let a = StateCache::new(daemon(&store, "node01"));
    let b = StateCache::new(daemon(&store, "node02"));

    a.update("instance", "i1", None, "initial").await.unwrap();
    b.update("instance", "i1", Some("initial"), "created").await.unwrap();
    a.update("instance", "i2", None, "created").await.unwrap();
    b.update("instance", "i2", Some("created"), "hard-deleted").await.unwrap();

    assert_eq!(a.states_of("instance", "i1").unwrap(), BTreeSet::from(["created".to_string()]));
    assert!(a.read("instance", "initial").unwrap().is_empty());
    let all = b.read("instance", "_all_").unwrap();
    assert_eq!(all.keys().collect::<Vec<_>>(), vec!["i1"]);
}

#[tokio::test]
async fn registered_nodes_are_scheduled() {
    let store = KvStore::open_in_memory().unwrap();
    let cache = StateCache::new(daemon(&store, "node1"));
    let dir = tempfile::tempdir().unwrap();

    for (name, ip, cpus) in [("node1", "10.0.0.1", 1), ("node2", "10.0.0.2", 4), ("node3", "10.0.0.3", 4)] {
        register_node(&store, &cache, &node_config(name, ip, dir.path())).await.unwrap();
        store
            .put_json(
                &metrics_key(name),
                &json!({
                    "metrics": {
                        "cpu_max": cpus,
                        "cpu_max_per_instance": cpus,
                        "memory_available": 30000,
                        "memory_max": 32000,
                        "disk_free_instances": 500 * GIB,
                        "is_hypervisor": name != "node1",
                    },
                    "timestamp": 1.0,
                }),
            )
            .unwrap();
    }

    let config = node_config("node1", "10.0.0.1", dir.path());
    let mut scheduler = Scheduler::new(store.clone(), cache, &config);
    let inst = InstanceRecord {
        uuid: "new-inst".to_string(),
        cpus: 2,
        memory: 2048,
        ..Default::default()
    };

    let mut candidates = scheduler.find_candidates(&inst, &[], None).await.unwrap();
    candidates.sort();
    assert_eq!(candidates, vec!["node2", "node3"]);
    assert_eq!(scheduler.get_network_node().unwrap().fqdn, "node1");

    let huge = InstanceRecord {
        cpus: 8,
        ..inst.clone()
    };
    let err = scheduler.find_candidates(&huge, &[], None).await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::LowResource(LowResource::RequestedCpuExceedsLimit)
    ));

    let summary = scheduler.summarize_resources().await.unwrap();
    assert_eq!(summary.nodes.len(), 3);
    assert_eq!(summary.cluster.cpu_available, 2 * 4 * 16);
}

#[tokio::test]
async fn node_processes_queued_work_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let config = node_config("node01", "10.0.0.5", dir.path());
    let path = config.store_path();

    {
        let store = KvStore::open(&path).unwrap();
        let queue = WorkQueue::new(daemon(&store, "node01"));
        queue.enqueue("node01", &preflight("inst-1"), Duration::ZERO).await.unwrap();
        queue.enqueue("node01", &preflight("inst-2"), Duration::ZERO).await.unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(Notify::new());
    let handler: TaskHandler = {
        let seen = seen.clone();
        let done = done.clone();
        Arc::new(move |_jobname: &str, item: &WorkItem| -> anyhow::Result<()> {
            let mut seen = seen.lock().unwrap();
            seen.push(item.instance_uuid().unwrap_or_default().to_string());
            if seen.len() == 2 {
                done.notify_one();
            }
            Ok(())
        })
    };

    let (tx, rx) = watch::channel(false);
    let node = tokio::spawn(run_node(config, handler, rx));
    tokio::time::timeout(Duration::from_secs(10), done.notified())
        .await
        .unwrap();
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), node)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["inst-1", "inst-2"]);

    let store = reopen(&path).await;
    let queue = WorkQueue::new(daemon(&store, "node01"));
    let length = queue.get_queue_length("node01").unwrap();
    assert_eq!((length.processing, length.queued), (0, 0));

    let cache = StateCache::new(daemon(&store, "node01"));
    let active: BTreeMap<_, _> = cache.read("node", "created").unwrap();
    assert!(active.contains_key("node01"));
}
