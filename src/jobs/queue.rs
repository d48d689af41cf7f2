//! Chunk-processing work queue: a dispatcher loop feeding a bounded pool
//! of workers, plus the finalization sequence that fires once every chunk
//! of a parent is settled.

use crate::assembler::Assembler;
use crate::gate::{Gates, Limiter};
use crate::jobs::manager::{JobError, JobManager};
use crate::jobs::models::{ParentId, ParentJob, SubJobId};
use crate::processor::ChunkProcessor;
use crate::webhook;
use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{
    Mutex, Semaphore,
    mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One unit of chunk-processing work.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub parent_id: ParentId,
    pub sub_job_id: SubJobId,
    pub chunk_index: usize,
}

#[derive(Debug, Clone)]
pub struct WorkQueueConfig {
    pub max_concurrent: usize,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

enum QueueCommand {
    Enqueue(WorkItem),
    Shutdown,
}

pub struct WorkQueue {
    manager: Arc<JobManager>,
    processor: Arc<ChunkProcessor>,
    assembler: Arc<Assembler>,
    gates: Arc<Gates>,
    http: reqwest::Client,
    config: WorkQueueConfig,
    semaphore: Arc<Semaphore>,
    command_tx: UnboundedSender<QueueCommand>,
    dispatcher_handle: Mutex<Option<JoinHandle<()>>>,
    inflight: AtomicUsize,
    shutting_down: AtomicBool,
}

impl WorkQueue {
    pub fn new(
        manager: Arc<JobManager>,
        processor: Arc<ChunkProcessor>,
        assembler: Arc<Assembler>,
        gates: Arc<Gates>,
        http: reqwest::Client,
        config: WorkQueueConfig,
    ) -> Arc<Self> {
        let max_concurrent = config.max_concurrent.max(1);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            manager,
            processor,
            assembler,
            gates,
            http,
            config: WorkQueueConfig { max_concurrent },
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            command_tx,
            dispatcher_handle: Mutex::new(None),
            inflight: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
        });
        queue.spawn_dispatcher(command_rx);
        queue
    }

    pub fn max_concurrent(&self) -> usize {
        self.config.max_concurrent
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    pub fn enqueue(&self, item: WorkItem) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(anyhow!("work queue is shutting down"));
        }
        self.command_tx
            .send(QueueCommand::Enqueue(item))
            .context("work queue dispatcher closed")?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.command_tx.send(QueueCommand::Shutdown) {
            warn!(target: "jobs::queue", error = %err, "Work queue dispatcher already closed");
        }
        if let Some(handle) = self.dispatcher_handle.lock().await.take() {
            handle.abort();
        }
    }

    fn spawn_dispatcher(self: &Arc<Self>, command_rx: UnboundedReceiver<QueueCommand>) {
        let queue = Arc::clone(self);
        let handle_slot = Arc::clone(self);
        let handle = tokio::spawn(async move {
            queue.run_dispatch_loop(command_rx).await;
        });
        tokio::spawn(async move {
            *handle_slot.dispatcher_handle.lock().await = Some(handle);
        });
    }

    async fn run_dispatch_loop(self: Arc<Self>, mut command_rx: UnboundedReceiver<QueueCommand>) {
        info!(
            target: "jobs::queue",
            concurrency = self.config.max_concurrent,
            "Work queue dispatcher started"
        );
        while let Some(command) = command_rx.recv().await {
            match command {
                QueueCommand::Enqueue(item) => self.launch_item(item).await,
                QueueCommand::Shutdown => {
                    debug!(target: "jobs::queue", "Work queue dispatcher shutting down");
                    break;
                }
            }
        }
        info!(target: "jobs::queue", "Work queue dispatcher stopped");
    }

    async fn launch_item(self: &Arc<Self>, item: WorkItem) {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(err) => {
                error!(
                    target: "jobs::queue",
                    error = %err,
                    "Failed to acquire worker permit"
                );
                return;
            }
        };
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            queue.execute_item(item).await;
            drop(permit);
            queue.inflight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn execute_item(self: &Arc<Self>, item: WorkItem) {
        let parent = match self.manager.get_parent(&item.parent_id).await {
            Ok(parent) => parent,
            Err(err) => {
                warn!(
                    target: "jobs::queue",
                    parent_id = %item.parent_id,
                    error = %err,
                    "Parent vanished before processing, dropping work item"
                );
                return;
            }
        };
        if parent.is_terminal() {
            debug!(
                target: "jobs::queue",
                parent_id = %item.parent_id,
                chunk_index = item.chunk_index,
                status = parent.status.as_str(),
                "Parent is terminal, dropping work item"
            );
            return;
        }

        let outcome = self
            .gates
            .run(
                Limiter::ChunkProcessing,
                self.processor.process(&item.sub_job_id, &parent),
            )
            .await;

        match outcome {
            Ok(result) => {
                match self
                    .manager
                    .process_completed_chunk(&item.parent_id, result)
                    .await
                {
                    Ok(_) => {}
                    Err(JobError::InvalidState(reason)) => {
                        // Terminal parent: in-flight work runs to completion
                        // but its result is dropped.
                        debug!(
                            target: "jobs::queue",
                            parent_id = %item.parent_id,
                            chunk_index = item.chunk_index,
                            reason = %reason,
                            "Completion refused"
                        );
                        return;
                    }
                    Err(err) => {
                        error!(
                            target: "jobs::queue",
                            parent_id = %item.parent_id,
                            chunk_index = item.chunk_index,
                            error = %err,
                            "Failed to record chunk completion"
                        );
                        return;
                    }
                }
            }
            Err(err) => {
                if err.is_retryable() && self.schedule_retry(&item).await {
                    return;
                }
                match self
                    .manager
                    .mark_chunk_failed(&item.parent_id, item.chunk_index, &err.to_string())
                    .await
                {
                    Ok(_) => {}
                    Err(JobError::InvalidState(reason)) => {
                        debug!(
                            target: "jobs::queue",
                            parent_id = %item.parent_id,
                            chunk_index = item.chunk_index,
                            reason = %reason,
                            "Failure record refused"
                        );
                        return;
                    }
                    Err(record_err) => {
                        error!(
                            target: "jobs::queue",
                            parent_id = %item.parent_id,
                            chunk_index = item.chunk_index,
                            error = %record_err,
                            "Failed to record chunk failure"
                        );
                        return;
                    }
                }
            }
        }

        self.maybe_finalize(&item.parent_id).await;
    }

    /// Increments the retry budget and re-enqueues after exponential
    /// backoff. Returns false when the budget is spent.
    async fn schedule_retry(self: &Arc<Self>, item: &WorkItem) -> bool {
        let mut sub_job = match self.manager.get_sub_job(&item.sub_job_id).await {
            Ok(sub_job) => sub_job,
            Err(_) => return false,
        };
        if sub_job.retry_count >= sub_job.max_retries {
            return false;
        }
        sub_job.retry_count += 1;
        let attempt = sub_job.retry_count;
        if self.manager.save_sub_job(&sub_job).await.is_err() {
            return false;
        }

        let delay = Duration::from_secs(1u64 << attempt.min(10));
        info!(
            target: "jobs::queue",
            parent_id = %item.parent_id,
            chunk_index = item.chunk_index,
            attempt,
            delay_secs = delay.as_secs(),
            "Scheduling chunk retry"
        );
        let queue = Arc::clone(self);
        let item = item.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = queue.enqueue(item.clone()) {
                warn!(
                    target: "jobs::queue",
                    parent_id = %item.parent_id,
                    chunk_index = item.chunk_index,
                    error = %err,
                    "Failed to re-enqueue chunk retry"
                );
            }
        });
        true
    }

    /// Runs terminal assembly once all chunks are settled: assemble,
    /// finalize the parent, fire the webhook, collect the sub-jobs.
    async fn maybe_finalize(self: &Arc<Self>, parent_id: &str) {
        match self.manager.check_ready_for_assembly(parent_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                warn!(
                    target: "jobs::queue",
                    parent_id = %parent_id,
                    error = %err,
                    "Assembly readiness check failed"
                );
                return;
            }
        }

        let parent = match self.manager.get_parent(parent_id).await {
            Ok(parent) => parent,
            Err(err) => {
                error!(
                    target: "jobs::queue",
                    parent_id = %parent_id,
                    error = %err,
                    "Parent vanished before assembly"
                );
                return;
            }
        };

        let output = self.assembler.assemble(&parent).await;
        let no_valid_chunks =
            output.stats.successful_chunks == 0 && output.stats.skipped_chunks == 0;

        let finalized = if no_valid_chunks {
            self.manager
                .fail_parent(parent_id, "no chunk produced a usable transcript")
                .await
        } else {
            self.manager.complete_parent(parent_id, &output).await
        };
        let parent = match finalized {
            Ok(parent) => parent,
            Err(err) => {
                error!(
                    target: "jobs::queue",
                    parent_id = %parent_id,
                    error = %err,
                    "Failed to finalize parent"
                );
                return;
            }
        };

        self.notify_webhook(&parent, &output).await;

        if let Err(err) = self.manager.gc_sub_jobs(parent_id).await {
            warn!(
                target: "jobs::queue",
                parent_id = %parent_id,
                error = %err,
                "Sub-job cleanup failed"
            );
        }
    }

    async fn notify_webhook(&self, parent: &ParentJob, output: &crate::assembler::AssemblyOutput) {
        let Some(url) = parent.webhook_url.as_deref() else {
            return;
        };
        let payload = webhook::final_result_payload(parent, output);
        webhook::deliver(&self.http, url, &payload).await;
    }
}
