//! Durable work queues.
//!
//! A work item lives under exactly one of `/sf/queue/<q>/<job>` (waiting)
//! or `/sf/processing/<q>/<job>` (claimed), and is deleted when resolved.
//! Job names start with the item's deadline, zero padded, so ascending key
//! order is deadline order. Every mutation of a queue happens under that
//! queue's lock; the queue → processing move is one atomic batch.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};
use vmgrid_core::{NETWORK_NODE_QUEUE, epoch_secs_f64};
use vmgrid_store::{KvOp, KvStore, construct_key, last_segment};

use crate::error::{CoordError, CoordResult};
use crate::lock::{LockGuard, LockManager};
use crate::tasks::{Task, WorkItem};

/// Sequence numbers tried per deadline before giving up.
pub const MAX_JOB_NAME_ATTEMPTS: u32 = 1000;

/// `<deadline>-<seq>`, e.g. `1700000000.250000-000`.
pub fn job_name(deadline: f64, seq: u32) -> String {
    format!("{deadline:017.6}-{seq:03}")
}

/// Parse the deadline back out of a job name.
pub fn job_deadline(jobname: &str) -> Option<f64> {
    let (deadline, _seq) = jobname.rsplit_once('-')?;
    deadline.parse().ok()
}

pub(crate) fn queue_prefix(queue: &str) -> String {
    construct_key("queue", queue, "")
}

pub(crate) fn queue_key(queue: &str, jobname: &str) -> String {
    construct_key("queue", queue, jobname)
}

pub(crate) fn processing_key(queue: &str, jobname: &str) -> String {
    construct_key("processing", queue, jobname)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueLength {
    /// Claimed and not yet resolved.
    pub processing: usize,
    /// Waiting with a deadline that has passed.
    pub queued: usize,
    /// Waiting with a deadline still in the future.
    pub deferred: usize,
}

/// Where an outstanding job currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Queue,
    Processing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutstandingJob {
    pub phase: JobPhase,
    pub queue: String,
    pub jobname: String,
    pub item: WorkItem,
}

#[derive(Clone)]
pub struct WorkQueue {
    store: KvStore,
    locks: LockManager,
}

impl WorkQueue {
    pub fn new(locks: LockManager) -> Self {
        Self {
            store: locks.store().clone(),
            locks,
        }
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    async fn lock_queue(&self, queue: &str, operation: &str) -> CoordResult<LockGuard> {
        self.locks.acquire("queue", "", queue, operation).await
    }

    /// Add `item` to `queue`, due after `delay`. Returns the job name.
    pub async fn enqueue(&self, queue: &str, item: &WorkItem, delay: Duration) -> CoordResult<String> {
        self.enqueue_at(queue, epoch_secs_f64() + delay.as_secs_f64(), item)
            .await
    }

    /// Add `item` to `queue` with an explicit deadline in epoch seconds.
    pub async fn enqueue_at(&self, queue: &str, deadline: f64, item: &WorkItem) -> CoordResult<String> {
        let bytes = item.encode()?;
        let guard = self.lock_queue(queue, "enqueue").await?;

        let mut created = None;
        for seq in 0..MAX_JOB_NAME_ATTEMPTS {
            let jobname = job_name(deadline, seq);
            if self.store.get(&processing_key(queue, &jobname))?.is_some() {
                continue;
            }
            if self
                .store
                .compare_and_swap(&queue_key(queue, &jobname), None, Some(&bytes))?
            {
                created = Some(jobname);
                break;
            }
        }
        guard.release()?;

        let Some(jobname) = created else {
            return Err(CoordError::JobNameExhausted {
                queue: queue.to_string(),
                attempts: MAX_JOB_NAME_ATTEMPTS,
            });
        };

        info!(
            %jobname,
            queuename = %queue,
            tasks = ?item.tasks.iter().map(Task::name).collect::<Vec<_>>(),
            "enqueued workitem"
        );
        Ok(jobname)
    }

    /// Claim the oldest due item in `queue`, moving it to processing.
    ///
    /// Returns `None` when the queue is empty or its head is still
    /// deferred. Entries that fail to decode are logged and skipped.
    pub async fn dequeue(&self, queue: &str) -> CoordResult<Option<(String, WorkItem)>> {
        let guard = self.lock_queue(queue, "dequeue").await?;
        let claimed = self.claim_next(queue);
        self.release_after_claim(queue, guard, claimed)
    }

    /// Release the queue lock taken for a claim.
    ///
    /// If the release fails the claimed item is moved back to the queue
    /// before the error is returned, so it is never left in processing
    /// with no consumer.
    fn release_after_claim(
        &self,
        queue: &str,
        guard: LockGuard,
        claimed: CoordResult<Option<(String, WorkItem)>>,
    ) -> CoordResult<Option<(String, WorkItem)>> {
        let Err(release_error) = guard.release() else {
            return claimed;
        };

        if let Ok(Some((jobname, _))) = &claimed {
            match self.unclaim(queue, jobname) {
                Ok(()) => warn!(
                    %jobname,
                    queuename = %queue,
                    "returned workitem to queue after failed lock release"
                ),
                Err(e) => error!(
                    %jobname,
                    queuename = %queue,
                    error = %e,
                    "cannot return workitem to queue after failed lock release"
                ),
            }
        }
        Err(release_error)
    }

    fn unclaim(&self, queue: &str, jobname: &str) -> CoordResult<()> {
        let processing = processing_key(queue, jobname);
        let Some(bytes) = self.store.get(&processing)? else {
            return Ok(());
        };
        self.store
            .batch(&[KvOp::put(queue_key(queue, jobname), bytes), KvOp::delete(processing)])?;
        Ok(())
    }

    fn claim_next(&self, queue: &str) -> CoordResult<Option<(String, WorkItem)>> {
        let now = epoch_secs_f64();

        for (key, bytes) in self.store.get_prefix(&queue_prefix(queue), 0)? {
            let jobname = last_segment(&key).to_string();
            let Some(deadline) = job_deadline(&jobname) else {
                warn!(%jobname, queuename = %queue, "skipping workitem with malformed job name");
                continue;
            };
            if deadline > now {
                return Ok(None);
            }

            let item = match WorkItem::decode(&bytes) {
                Ok(item) => item,
                Err(e) => {
                    warn!(%jobname, queuename = %queue, error = %e, "skipping undecodable workitem");
                    continue;
                }
            };

            self.store.batch(&[
                KvOp::put(processing_key(queue, &jobname), bytes),
                KvOp::delete(key),
            ])?;
            info!(%jobname, queuename = %queue, "moved workitem from queue to processing");
            return Ok(Some((jobname, item)));
        }

        Ok(None)
    }

    /// Mark a claimed item as durably complete.
    pub async fn resolve(&self, queue: &str, jobname: &str) -> CoordResult<()> {
        let guard = self.lock_queue(queue, "resolve").await?;
        let removed = self.store.delete(&processing_key(queue, jobname));
        guard.release()?;

        if removed? {
            info!(%jobname, queuename = %queue, "resolved workitem");
        } else {
            warn!(%jobname, queuename = %queue, "resolved workitem was not in processing");
        }
        Ok(())
    }

    pub fn get_queue_length(&self, queue: &str) -> CoordResult<QueueLength> {
        let now = epoch_secs_f64();
        let mut length = QueueLength::default();

        for (key, _) in self.store.get_prefix(&queue_prefix(queue), 0)? {
            match job_deadline(last_segment(&key)) {
                Some(deadline) if deadline > now => length.deferred += 1,
                _ => length.queued += 1,
            }
        }
        length.processing = self
            .store
            .get_prefix(&construct_key("processing", queue, ""), 0)?
            .len();
        Ok(length)
    }

    /// Move everything in `processing/<queue>` back to `queue/<queue>`,
    /// keeping job names. Returns how many items were reset.
    pub async fn restart_queue(&self, queue: &str) -> CoordResult<usize> {
        let guard = self.lock_queue(queue, "restart queue").await?;
        let reset = self.requeue_processing(queue);
        guard.release()?;
        reset
    }

    fn requeue_processing(&self, queue: &str) -> CoordResult<usize> {
        let entries = self
            .store
            .get_prefix(&construct_key("processing", queue, ""), 0)?;
        if entries.is_empty() {
            return Ok(0);
        }

        let mut ops = Vec::with_capacity(entries.len() * 2);
        for (key, bytes) in entries {
            let jobname = last_segment(&key).to_string();
            warn!(%jobname, queuename = %queue, "reset workitem");
            ops.push(KvOp::put(queue_key(queue, &jobname), bytes));
            ops.push(KvOp::delete(key));
        }
        let reset = ops.len() / 2;
        self.store.batch(&ops)?;
        Ok(reset)
    }

    /// Reset this node's queue, plus the network node queue when this
    /// node holds that role.
    pub async fn restart_queues(&self, node: &str, is_network_node: bool) -> CoordResult<usize> {
        let mut reset = 0;
        if is_network_node {
            reset += self.restart_queue(NETWORK_NODE_QUEUE).await?;
        }
        reset += self.restart_queue(node).await?;
        debug!(%node, is_network_node, reset, "restarted queues");
        Ok(reset)
    }

    /// Every claimed then every waiting job across all queues.
    pub fn get_outstanding_jobs(&self) -> CoordResult<Vec<OutstandingJob>> {
        let mut jobs = Vec::new();
        for (phase, root) in [(JobPhase::Processing, "processing"), (JobPhase::Queue, "queue")] {
            for (key, bytes) in self.store.get_prefix(&construct_key(root, "", ""), 0)? {
                // /sf/<root>/<queue>/<jobname>
                let mut parts = key.rsplitn(3, '/');
                let (Some(jobname), Some(queue)) = (parts.next(), parts.next()) else {
                    continue;
                };
                match WorkItem::decode(&bytes) {
                    Ok(item) => jobs.push(OutstandingJob {
                        phase,
                        queue: queue.to_string(),
                        jobname: jobname.to_string(),
                        item,
                    }),
                    Err(e) => warn!(%key, error = %e, "skipping undecodable outstanding job"),
                }
            }
        }
        Ok(jobs)
    }

    /// Image URL → nodes with an outstanding fetch of it. Fetches queued
    /// for the network node, or for any node in `absent_nodes`, are ignored.
    pub fn get_current_image_fetches(&self, absent_nodes: &[&str]) -> CoordResult<BTreeMap<String, Vec<String>>> {
        let mut fetches: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for job in self.get_outstanding_jobs()? {
            if job.queue == NETWORK_NODE_QUEUE {
                continue;
            }
            for task in &job.item.tasks {
                let Task::ImageFetch { url, .. } = task else {
                    continue;
                };
                if absent_nodes.contains(&job.queue.as_str()) {
                    warn!(%url, node = %job.queue, phase = ?job.phase, "node is absent, ignoring fetch");
                } else {
                    debug!(%url, node = %job.queue, phase = ?job.phase, "node is fetching image");
                    fetches.entry(url.clone()).or_default().push(job.queue.clone());
                }
            }
        }
        Ok(fetches)
    }
}

#[cfg(test)]
mod tests {
    use vmgrid_store::lock_key;

    use super::*;

    fn queue() -> WorkQueue {
        let store = KvStore::open_in_memory().unwrap();
        WorkQueue::new(
            LockManager::new(store, "node01")
                .with_timeout(Duration::from_secs(5))
                .with_poll_interval(Duration::from_millis(5)),
        )
    }

    fn start(uuid: &str) -> WorkItem {
        WorkItem::single(Task::InstanceStart {
            instance_uuid: uuid.to_string(),
            network: vec![],
        })
        .unwrap()
    }

    #[test]
    fn job_names_sort_by_deadline() {
        let early = job_name(999_999_999.5, 0);
        let late = job_name(1_700_000_000.25, 0);
        assert_eq!(late, "1700000000.250000-000");
        assert_eq!(early, "0999999999.500000-000");
        assert!(early < late);
        assert!(job_name(1.0, 2) > job_name(1.0, 1));
        assert_eq!(job_deadline(&late), Some(1_700_000_000.25));
        assert_eq!(job_deadline("garbage"), None);
    }

    #[tokio::test]
    async fn same_deadline_gets_next_sequence() {
        let q = queue();
        let a = q.enqueue_at("node01", 100.0, &start("a")).await.unwrap();
        let b = q.enqueue_at("node01", 100.0, &start("b")).await.unwrap();
        assert_eq!(a, "0000000100.000000-000");
        assert_eq!(b, "0000000100.000000-001");
    }

    #[tokio::test]
    async fn sequence_skips_names_in_processing() {
        let q = queue();
        let a = q.enqueue_at("node01", 100.0, &start("a")).await.unwrap();
        q.dequeue("node01").await.unwrap().unwrap();
        let b = q.enqueue_at("node01", 100.0, &start("b")).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn dequeue_moves_to_processing_and_resolve_deletes() {
        let q = queue();
        let jobname = q.enqueue("node01", &start("a"), Duration::ZERO).await.unwrap();

        let (claimed, item) = q.dequeue("node01").await.unwrap().unwrap();
        assert_eq!(claimed, jobname);
        assert_eq!(item, start("a"));
        assert_eq!(
            q.get_queue_length("node01").unwrap(),
            QueueLength { processing: 1, queued: 0, deferred: 0 }
        );
        assert!(q.dequeue("node01").await.unwrap().is_none());

        q.resolve("node01", &jobname).await.unwrap();
        assert_eq!(q.get_queue_length("node01").unwrap(), QueueLength::default());
    }

    #[tokio::test]
    async fn lost_queue_lock_returns_claimed_item() {
        let q = queue();
        let jobname = q.enqueue("node01", &start("a"), Duration::ZERO).await.unwrap();

        let guard = q.lock_queue("node01", "dequeue").await.unwrap();
        let claimed = q.claim_next("node01");
        assert_eq!(q.get_queue_length("node01").unwrap().processing, 1);

        // Someone else takes the lock record before we release it.
        let lock = lock_key(guard.path());
        q.store().put(&lock, b"{}").unwrap();

        let err = q.release_after_claim("node01", guard, claimed).unwrap_err();
        assert!(matches!(err, CoordError::LockRelease(_)));
        assert_eq!(
            q.get_queue_length("node01").unwrap(),
            QueueLength { processing: 0, queued: 1, deferred: 0 }
        );

        q.store().delete(&lock).unwrap();
        let (again, item) = q.dequeue("node01").await.unwrap().unwrap();
        assert_eq!(again, jobname);
        assert_eq!(item, start("a"));
    }

    #[tokio::test]
    async fn deferred_items_are_not_dequeued() {
        let q = queue();
        q.enqueue("node01", &start("later"), Duration::from_secs(3600)).await.unwrap();

        assert!(q.dequeue("node01").await.unwrap().is_none());
        assert_eq!(q.get_queue_length("node01").unwrap().deferred, 1);
    }

    #[tokio::test]
    async fn undecodable_entries_are_skipped() {
        let q = queue();
        q.store().put(&queue_key("node01", &job_name(1.0, 0)), b"not json").unwrap();
        let good = q.enqueue_at("node01", 2.0, &start("good")).await.unwrap();

        let (jobname, _) = q.dequeue("node01").await.unwrap().unwrap();
        assert_eq!(jobname, good);
    }

    #[tokio::test]
    async fn restart_queue_preserves_job_names() {
        let q = queue();
        let jobname = q.enqueue_at("node01", 5.0, &start("a")).await.unwrap();
        q.dequeue("node01").await.unwrap().unwrap();

        assert_eq!(q.restart_queue("node01").await.unwrap(), 1);
        assert_eq!(q.restart_queue("node01").await.unwrap(), 0);
        let (again, _) = q.dequeue("node01").await.unwrap().unwrap();
        assert_eq!(again, jobname);
    }

    #[tokio::test]
    async fn restart_queues_includes_network_node_when_held() {
        let q = queue();
        q.enqueue_at(NETWORK_NODE_QUEUE, 1.0, &start("n")).await.unwrap();
        q.dequeue(NETWORK_NODE_QUEUE).await.unwrap().unwrap();

        assert_eq!(q.restart_queues("node01", false).await.unwrap(), 0);
        assert_eq!(q.restart_queues("node01", true).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn outstanding_jobs_and_image_fetches() {
        let q = queue();
        let fetch = |url: &str| {
            WorkItem::single(Task::ImageFetch {
                url: url.to_string(),
                instance_uuid: None,
            })
            .unwrap()
        };
        q.enqueue_at("node01", 1.0, &fetch("http://a")).await.unwrap();
        q.enqueue_at("node02", 1.0, &fetch("http://a")).await.unwrap();
        q.enqueue_at(NETWORK_NODE_QUEUE, 1.0, &fetch("http://b")).await.unwrap();
        q.dequeue("node02").await.unwrap().unwrap();

        let jobs = q.get_outstanding_jobs().unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].phase, JobPhase::Processing);
        assert_eq!(jobs[0].queue, "node02");

        let fetches = q.get_current_image_fetches(&["node01"]).unwrap();
        assert_eq!(fetches.len(), 1);
        assert_eq!(fetches["http://a"], vec!["node02".to_string()]);
    }
}
