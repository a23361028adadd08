//! A live, in-memory view of one queue.
//!
//! One actor task owns the index (deadline → job names, job name →
//! payload). It is seeded by a full scan and kept current by a prefix
//! watch; callers talk to it over a command channel, so no lock guards
//! the index. Pending watch events are always applied before a command
//! is answered.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use vmgrid_core::epoch_secs_f64;
use vmgrid_store::{KvOp, KvStore, WatchError, WatchEvent, Watcher, last_segment};

use crate::error::{CoordError, CoordResult};
use crate::queue::{job_deadline, processing_key, queue_key, queue_prefix};
use crate::tasks::WorkItem;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

enum Command {
    GetWorkitems {
        max: Option<usize>,
        reply: oneshot::Sender<Vec<(String, WorkItem)>>,
    },
    Return {
        jobname: String,
        reply: oneshot::Sender<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Deadlines are indexed in whole microseconds.
fn deadline_micros(deadline: f64) -> u64 {
    (deadline.max(0.0) * 1_000_000.0).round() as u64
}

#[derive(Default)]
struct QueueIndex {
    deadlines: BTreeMap<u64, BTreeSet<String>>,
    workitems: HashMap<String, WorkItem>,
    /// Returned by `get_workitems` but still under `queue/` in the store.
    handed_out: HashSet<String>,
}

impl QueueIndex {
    fn insert(&mut self, queue: &str, jobname: &str, bytes: &[u8]) {
        if self.handed_out.contains(jobname) {
            return;
        }
        let Some(deadline) = job_deadline(jobname) else {
            warn!(%jobname, queuename = %queue, "ignoring workitem with malformed job name");
            return;
        };
        let item = match WorkItem::decode(bytes) {
            Ok(item) => item,
            Err(e) => {
                warn!(%jobname, queuename = %queue, error = %e, "ignoring undecodable workitem");
                return;
            }
        };
        self.deadlines
            .entry(deadline_micros(deadline))
            .or_default()
            .insert(jobname.to_string());
        self.workitems.insert(jobname.to_string(), item);
    }

    fn remove(&mut self, jobname: &str) {
        self.handed_out.remove(jobname);
        if self.workitems.remove(jobname).is_none() {
            return;
        }
        if let Some(deadline) = job_deadline(jobname) {
            let micros = deadline_micros(deadline);
            if let Some(names) = self.deadlines.get_mut(&micros) {
                names.remove(jobname);
                if names.is_empty() {
                    self.deadlines.remove(&micros);
                }
            }
        }
    }

    /// Remove and return due items, oldest first.
    fn drain_due(&mut self, now: f64, max: Option<usize>) -> Vec<(String, WorkItem)> {
        let now = deadline_micros(now);
        let max = max.unwrap_or(usize::MAX);
        let mut due = Vec::new();

        while due.len() < max {
            let Some(mut entry) = self.deadlines.first_entry() else {
                break;
            };
            if *entry.key() >= now {
                break;
            }
            let Some(jobname) = entry.get_mut().pop_first() else {
                entry.remove();
                continue;
            };
            if entry.get().is_empty() {
                entry.remove();
            }
            if let Some(item) = self.workitems.remove(&jobname) {
                self.handed_out.insert(jobname.clone());
                due.push((jobname, item));
            }
        }
        due
    }

    /// Stop tracking a handed out item and index it again if it is
    /// still waiting in the store.
    fn hand_back(&mut self, store: &KvStore, queue: &str, jobname: &str) -> CoordResult<()> {
        if !self.handed_out.remove(jobname) {
            return Ok(());
        }
        if let Some(bytes) = store.get(&queue_key(queue, jobname))? {
            self.insert(queue, jobname, &bytes);
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.workitems.len()
    }
}

fn scan(store: &KvStore, queue: &str, index: &mut QueueIndex) -> CoordResult<()> {
    let entries = store.get_prefix(&queue_prefix(queue), 0)?;
    let present: HashSet<String> = entries
        .iter()
        .map(|(key, _)| last_segment(key).to_string())
        .collect();

    let handed_out = std::mem::take(&mut index.handed_out);
    *index = QueueIndex::default();
    index.handed_out = handed_out.into_iter().filter(|j| present.contains(j)).collect();

    for (key, bytes) in entries {
        index.insert(queue, last_segment(&key), &bytes);
    }
    Ok(())
}

struct QueueActor {
    name: String,
    store: KvStore,
    watcher: Watcher,
    commands: mpsc::Receiver<Command>,
    index: QueueIndex,
}

impl QueueActor {
    async fn run(mut self) {
        debug!(queuename = %self.name, items = self.index.len(), "live queue started");

        loop {
            tokio::select! {
                biased;

                event = self.watcher.recv() => match event {
                    Ok(WatchEvent::Put { key, value }) => {
                        let jobname = last_segment(&key);
                        self.index.insert(&self.name, jobname, &value);
                        info!(%jobname, queuename = %self.name, "discovered workitem");
                    }
                    Ok(WatchEvent::Delete { key }) => {
                        let jobname = last_segment(&key);
                        self.index.remove(jobname);
                        debug!(%jobname, queuename = %self.name, "removed workitem");
                    }
                    Err(WatchError::Lagged { skipped }) => {
                        warn!(queuename = %self.name, skipped, "live queue lagged, rescanning");
                        if let Err(e) = scan(&self.store, &self.name, &mut self.index) {
                            warn!(queuename = %self.name, error = %e, "live queue rescan failed");
                        }
                    }
                    Err(WatchError::Closed) => {
                        info!(queuename = %self.name, "store closed, live queue stopping");
                        break;
                    }
                },

                command = self.commands.recv() => match command {
                    Some(Command::GetWorkitems { max, reply }) => {
                        let due = self.index.drain_due(epoch_secs_f64(), max);
                        let _ = reply.send(due);
                    }
                    Some(Command::Return { jobname, reply }) => {
                        match self.index.hand_back(&self.store, &self.name, &jobname) {
                            Ok(()) => debug!(%jobname, queuename = %self.name, "workitem handed back"),
                            Err(e) => warn!(
                                %jobname,
                                queuename = %self.name,
                                error = %e,
                                "cannot hand back workitem"
                            ),
                        }
                        let _ = reply.send(());
                    }
                    Some(Command::Close { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                },
            }
        }

        debug!(queuename = %self.name, "live queue stopped");
    }
}

/// Low-latency consumer of one queue.
///
/// Items returned by [`get_workitems`](Self::get_workitems) are still
/// stored under `queue/`; the consumer claims each with
/// [`mark_workitem_as_processing`](Self::mark_workitem_as_processing)
/// and finishes with
/// [`mark_workitem_as_completed`](Self::mark_workitem_as_completed).
pub struct LiveQueue {
    name: String,
    store: KvStore,
    commands: mpsc::Sender<Command>,
}

impl LiveQueue {
    /// Start watching `name`. Must be called inside a tokio runtime.
    pub fn open(store: KvStore, name: impl Into<String>) -> CoordResult<Self> {
        let name = name.into();
        // Subscribe first so nothing committed after the scan is missed.
        let watcher = store.watch_prefix(&queue_prefix(&name));
        let mut index = QueueIndex::default();
        scan(&store, &name, &mut index)?;

        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = QueueActor {
            name: name.clone(),
            store: store.clone(),
            watcher,
            commands: rx,
            index,
        };
        tokio::spawn(actor.run());

        Ok(Self {
            name,
            store,
            commands: tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take up to `max` due items (all of them for `None`), oldest first.
    pub async fn get_workitems(&self, max: Option<usize>) -> CoordResult<Vec<(String, WorkItem)>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::GetWorkitems { max, reply })
            .await
            .map_err(|_| CoordError::QueueClosed(self.name.clone()))?;
        rx.await.map_err(|_| CoordError::QueueClosed(self.name.clone()))
    }

    /// Give back an item taken by `get_workitems` but not claimed, so a
    /// later call can return it again.
    pub async fn return_workitem(&self, jobname: &str) -> CoordResult<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Return {
                jobname: jobname.to_string(),
                reply,
            })
            .await
            .map_err(|_| CoordError::QueueClosed(self.name.clone()))?;
        rx.await.map_err(|_| CoordError::QueueClosed(self.name.clone()))
    }

    /// Move an item from `queue/` to `processing/`.
    ///
    /// Fails with `WorkitemGone` if the item has left `queue/`, for
    /// example because another consumer claimed it.
    pub fn mark_workitem_as_processing(&self, jobname: &str, item: &WorkItem) -> CoordResult<()> {
        if self.store.get(&queue_key(&self.name, jobname))?.is_none() {
            return Err(CoordError::WorkitemGone {
                queue: self.name.clone(),
                jobname: jobname.to_string(),
            });
        }
        self.store.batch(&[
            KvOp::put(processing_key(&self.name, jobname), item.encode()?),
            KvOp::delete(queue_key(&self.name, jobname)),
        ])?;
        info!(%jobname, queuename = %self.name, "moved workitem from queue to processing");
        Ok(())
    }

    pub fn mark_workitem_as_completed(&self, jobname: &str) -> CoordResult<()> {
        self.store.delete(&processing_key(&self.name, jobname))?;
        info!(%jobname, queuename = %self.name, "moved workitem from processing to completed");
        Ok(())
    }

    /// Stop the actor and drop the index.
    pub async fn close(&self) -> CoordResult<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Close { reply })
            .await
            .map_err(|_| CoordError::QueueClosed(self.name.clone()))?;
        let _ = rx.await;
        Ok(())
    }
}
