//! Queue worker: drains one live queue and hands each item to a handler.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use vmgrid_coord::{LiveQueue, WorkItem};

/// Executes one work item. `jobname` identifies it in logs.
pub type TaskHandler = Arc<dyn Fn(&str, &WorkItem) -> anyhow::Result<()> + Send + Sync>;

/// Handler that records each task and does nothing else.
pub fn logging_handler() -> TaskHandler {
    Arc::new(|jobname: &str, item: &WorkItem| -> anyhow::Result<()> {
        for task in &item.tasks {
            info!(
                %jobname,
                task = task.name(),
                instance = task.instance_uuid(),
                network = task.network_uuid(),
                "{}",
                task.pretty_name()
            );
        }
        Ok(())
    })
}

pub struct QueueWorker {
    queue: LiveQueue,
    handler: TaskHandler,
    batch_size: usize,
    poll_interval: Duration,
}

impl QueueWorker {
    pub fn new(queue: LiveQueue, handler: TaskHandler) -> Self {
        Self {
            queue,
            handler,
            batch_size: 5,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn queue(&self) -> &LiveQueue {
        &self.queue
    }

    /// Run every item that is currently due, up to one batch. Returns how
    /// many items were run.
    ///
    /// A failing handler is logged; its item is still completed. An item
    /// that cannot be claimed is handed back to the live queue and the
    /// rest of the batch carries on.
    pub async fn process_due(&self) -> anyhow::Result<usize> {
        let items = self.queue.get_workitems(Some(self.batch_size)).await?;
        let mut count = 0;

        for (jobname, item) in items {
            if let Err(e) = self.queue.mark_workitem_as_processing(&jobname, &item) {
                warn!(
                    %jobname,
                    queuename = %self.queue.name(),
                    error = %e,
                    "cannot claim workitem"
                );
                self.queue.return_workitem(&jobname).await?;
                continue;
            }

            if let Err(e) = (self.handler)(&jobname, &item) {
                error!(
                    %jobname,
                    queuename = %self.queue.name(),
                    error = %e,
                    "workitem failed"
                );
            }
            count += 1;

            // Left in processing; startup recovery puts it back.
            if let Err(e) = self.queue.mark_workitem_as_completed(&jobname) {
                error!(
                    %jobname,
                    queuename = %self.queue.name(),
                    error = %e,
                    "cannot complete workitem"
                );
            }
        }

        if count > 0 {
            debug!(queuename = %self.queue.name(), count, "processed workitems");
        }
        Ok(count)
    }

    /// Process items until the shutdown signal fires, then close the queue.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(queuename = %self.queue.name(), "queue worker started");

        while !*shutdown.borrow() {
            match self.process_due().await {
                Ok(n) if n > 0 => continue,
                Ok(_) => {}
                Err(e) => warn!(queuename = %self.queue.name(), error = %e, "queue worker pass failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        if let Err(e) = self.queue.close().await {
            debug!(queuename = %self.queue.name(), error = %e, "queue already closed");
        }
        info!(queuename = %self.queue.name(), "queue worker shutting down");
    }
}
