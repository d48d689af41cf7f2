//! Authoritative lifecycle state of parent jobs and their sub-jobs.
//!
//! Every mutation of a given parent is serialized by a per-parent lock and
//! persisted as one whole record, so readers always observe a consistent
//! snapshot and completion accounting stays idempotent under retries: the
//! first observation of a chunk sets its bit and moves the counters, later
//! observations update stored text only.

use crate::assembler::AssemblyOutput;
use crate::jobs::models::{
    ByteRange, ChunkFailure, ChunkResult, ChunkSlot, ParentId, ParentJob, ParentJobSummary,
    ParentStatus, SubJob, SubJobId, SubJobStatus,
};
use crate::store::{KvStore, ObjectStore, parent_key, sub_job_key};
use anyhow::Context;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Job-level error, mapped onto the HTTP surface by the API layer.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidState(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type JobResult<T> = Result<T, JobError>;

pub struct JobManager {
    kv: Arc<dyn KvStore>,
    objects: Arc<dyn ObjectStore>,
    /// Per-parent write locks; readers work from snapshots.
    locks: DashMap<ParentId, Arc<Mutex<()>>>,
    ttl: Duration,
}

impl JobManager {
    pub fn new(kv: Arc<dyn KvStore>, objects: Arc<dyn ObjectStore>, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            kv,
            objects,
            locks: DashMap::new(),
            ttl,
        })
    }

    fn parent_lock(&self, parent_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(parent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn persist_parent(&self, job: &ParentJob) -> JobResult<()> {
        let value = serde_json::to_value(job).context("failed to serialize parent job")?;
        self.kv
            .put(&parent_key(&job.id), value, self.ttl)
            .await
            .context("failed to persist parent job")?;
        Ok(())
    }

    async fn load_parent(&self, parent_id: &str) -> JobResult<ParentJob> {
        let value = self
            .kv
            .get(&parent_key(parent_id))
            .await
            .context("failed to read parent job")?
            .ok_or_else(|| JobError::NotFound(format!("parent job {}", parent_id)))?;
        Ok(serde_json::from_value(value).context("failed to deserialize parent job")?)
    }

    /// Public snapshot read; safe to poll concurrently with writers.
    pub async fn get_parent(&self, parent_id: &str) -> JobResult<ParentJob> {
        self.load_parent(parent_id).await
    }

    pub async fn save_sub_job(&self, sub_job: &SubJob) -> JobResult<()> {
        let value = serde_json::to_value(sub_job).context("failed to serialize sub-job")?;
        self.kv
            .put(&sub_job_key(&sub_job.id), value, self.ttl)
            .await
            .context("failed to persist sub-job")?;
        Ok(())
    }

    pub async fn get_sub_job(&self, sub_job_id: &str) -> JobResult<SubJob> {
        let value = self
            .kv
            .get(&sub_job_key(sub_job_id))
            .await
            .context("failed to read sub-job")?
            .ok_or_else(|| JobError::NotFound(format!("sub-job {}", sub_job_id)))?;
        Ok(serde_json::from_value(value).context("failed to deserialize sub-job")?)
    }

    /// Persists a freshly built parent record and returns the snapshot.
    pub async fn create_parent(&self, job: ParentJob) -> JobResult<ParentJob> {
        self.persist_parent(&job).await?;
        info!(
            target: "jobs::manager",
            parent_id = %job.id,
            filename = %job.filename,
            total_chunks = job.total_chunks,
            chunking = ?job.chunking_method,
            "Parent job created"
        );
        Ok(job)
    }

    /// Persists a sub-job and registers it with its parent.
    pub async fn register_sub_job(&self, sub_job: SubJob) -> JobResult<SubJob> {
        self.save_sub_job(&sub_job).await?;
        let lock = self.parent_lock(&sub_job.parent_id);
        let _guard = lock.lock().await;
        let mut parent = self.load_parent(&sub_job.parent_id).await?;
        if !parent.sub_jobs.contains(&sub_job.id) {
            parent.sub_jobs.push(sub_job.id.clone());
            self.persist_parent(&parent).await?;
        }
        Ok(sub_job)
    }

    /// Records that chunk `chunk_index`'s bytes are durably stored.
    /// Idempotent: a second call is a no-op.
    pub async fn mark_chunk_uploaded(
        &self,
        parent_id: &str,
        chunk_index: usize,
    ) -> JobResult<ParentJob> {
        let lock = self.parent_lock(parent_id);
        let _guard = lock.lock().await;
        let mut parent = self.load_parent(parent_id).await?;
        if parent.is_terminal() {
            return Err(JobError::InvalidState(format!(
                "parent job {} is already {}",
                parent_id,
                parent.status.as_str()
            )));
        }
        if parent.uploaded_flags.set(chunk_index) {
            parent.uploaded_count += 1;
            if parent.status == ParentStatus::Uploading && parent.uploaded_count >= 1 {
                parent.status = ParentStatus::Processing;
                parent.processing_started_at = Some(Utc::now());
            }
            parent.recompute_progress();
            self.persist_parent(&parent).await?;
        }
        Ok(parent)
    }

    /// Stores a chunk's finished result. The completion bit makes counting
    /// idempotent: a duplicate delivery replaces the stored text but never
    /// moves the counters.
    pub async fn process_completed_chunk(
        &self,
        parent_id: &str,
        mut result: ChunkResult,
    ) -> JobResult<ParentJob> {
        let chunk_index = result.chunk_index;
        let lock = self.parent_lock(parent_id);
        let _guard = lock.lock().await;
        let mut parent = self.load_parent(parent_id).await?;
        if parent.is_terminal() {
            return Err(JobError::InvalidState(format!(
                "parent job {} is {}; chunk {} result discarded",
                parent_id,
                parent.status.as_str(),
                chunk_index
            )));
        }
        if chunk_index >= parent.total_chunks {
            return Err(JobError::InvalidState(format!(
                "chunk index {} out of range for parent {}",
                chunk_index, parent_id
            )));
        }

        if parent.completed_flags.set(chunk_index) {
            if result.has_text() || result.skipped {
                parent.completed_count += 1;
            } else {
                parent.failed_count += 1;
            }
            if parent.first_chunk_completed_at.is_none() {
                parent.first_chunk_completed_at = Some(Utc::now());
            }
            parent.transcripts[chunk_index] = ChunkSlot::Result(result);
            parent.recompute_progress();
            parent.recompute_success_rate();
            debug!(
                target: "jobs::manager",
                parent_id = %parent_id,
                chunk_index,
                completed = parent.completed_count,
                failed = parent.failed_count,
                "Chunk completion recorded"
            );
        } else {
            // Duplicate delivery after a retry: refresh the stored text but
            // keep the streamed flag so reconnects stay deduplicated.
            result.streamed = parent.transcripts[chunk_index].streamed();
            parent.transcripts[chunk_index] = ChunkSlot::Result(result);
            debug!(
                target: "jobs::manager",
                parent_id = %parent_id,
                chunk_index,
                "Duplicate chunk completion; counters unchanged"
            );
        }
        self.persist_parent(&parent).await?;
        Ok(parent)
    }

    /// Mirror of `process_completed_chunk` for the failure path.
    pub async fn mark_chunk_failed(
        &self,
        parent_id: &str,
        chunk_index: usize,
        error: &str,
    ) -> JobResult<ParentJob> {
        let lock = self.parent_lock(parent_id);
        let _guard = lock.lock().await;
        let mut parent = self.load_parent(parent_id).await?;
        if parent.is_terminal() {
            return Err(JobError::InvalidState(format!(
                "parent job {} is {}; chunk {} failure discarded",
                parent_id,
                parent.status.as_str(),
                chunk_index
            )));
        }
        if chunk_index >= parent.total_chunks {
            return Err(JobError::InvalidState(format!(
                "chunk index {} out of range for parent {}",
                chunk_index, parent_id
            )));
        }

        if parent.completed_flags.set(chunk_index) {
            parent.failed_count += 1;
            if parent.first_chunk_completed_at.is_none() {
                parent.first_chunk_completed_at = Some(Utc::now());
            }
            parent.transcripts[chunk_index] = ChunkSlot::Failure(ChunkFailure::new(
                chunk_index,
                error,
            ));
            parent.recompute_progress();
            parent.recompute_success_rate();
            warn!(
                target: "jobs::manager",
                parent_id = %parent_id,
                chunk_index,
                error = %error,
                failed = parent.failed_count,
                "Chunk failure recorded"
            );
        } else {
            let streamed = parent.transcripts[chunk_index].streamed();
            let mut failure = ChunkFailure::new(chunk_index, error);
            failure.streamed = streamed;
            parent.transcripts[chunk_index] = ChunkSlot::Failure(failure);
        }
        self.persist_parent(&parent).await?;
        Ok(parent)
    }

    /// True exactly once: when every chunk is settled and the parent has
    /// not yet entered assembly. Transitions to `Assembling` on true.
    pub async fn check_ready_for_assembly(&self, parent_id: &str) -> JobResult<bool> {
        let lock = self.parent_lock(parent_id);
        let _guard = lock.lock().await;
        let mut parent = self.load_parent(parent_id).await?;
        let ready = parent.all_chunks_settled()
            && !matches!(
                parent.status,
                ParentStatus::Assembling
                    | ParentStatus::Done
                    | ParentStatus::Failed
                    | ParentStatus::Cancelled
            );
        if ready {
            parent.status = ParentStatus::Assembling;
            parent.assembly_started_at = Some(Utc::now());
            self.persist_parent(&parent).await?;
            info!(
                target: "jobs::manager",
                parent_id = %parent_id,
                completed = parent.completed_count,
                failed = parent.failed_count,
                "Parent ready for assembly"
            );
        }
        Ok(ready)
    }

    /// Finalizes a parent with its assembled transcripts.
    pub async fn complete_parent(
        &self,
        parent_id: &str,
        output: &AssemblyOutput,
    ) -> JobResult<ParentJob> {
        let lock = self.parent_lock(parent_id);
        let _guard = lock.lock().await;
        let mut parent = self.load_parent(parent_id).await?;
        if parent.is_terminal() {
            return Err(JobError::InvalidState(format!(
                "parent job {} is already {}",
                parent_id,
                parent.status.as_str()
            )));
        }
        parent.status = ParentStatus::Done;
        parent.final_transcript = Some(output.final_transcript.clone());
        parent.raw_transcript = Some(output.raw_transcript.clone());
        parent.corrected_transcript = output.corrected_transcript.clone();
        parent.assembly_method = Some(output.method);
        parent.success_rate = output.stats.success_rate;
        parent.llm_error = output.llm_error.clone();
        parent.progress = 100;
        parent.upload_progress = 100;
        parent.processing_progress = 100;
        parent.completed_at = Some(Utc::now());
        self.persist_parent(&parent).await?;
        info!(
            target: "jobs::manager",
            parent_id = %parent_id,
            method = ?output.method,
            success_rate = parent.success_rate,
            "Parent job done"
        );
        Ok(parent)
    }

    /// Marks a parent as failed. Used when assembly finds no valid chunks.
    pub async fn fail_parent(&self, parent_id: &str, reason: &str) -> JobResult<ParentJob> {
        let lock = self.parent_lock(parent_id);
        let _guard = lock.lock().await;
        let mut parent = self.load_parent(parent_id).await?;
        if parent.is_terminal() {
            return Err(JobError::InvalidState(format!(
                "parent job {} is already {}",
                parent_id,
                parent.status.as_str()
            )));
        }
        parent.status = ParentStatus::Failed;
        parent.error = Some(reason.to_string());
        parent.completed_at = Some(Utc::now());
        self.persist_parent(&parent).await?;
        warn!(
            target: "jobs::manager",
            parent_id = %parent_id,
            reason = %reason,
            "Parent job failed"
        );
        Ok(parent)
    }

    /// Cancels a non-terminal parent. Calling it again is a no-op that
    /// returns the already-cancelled snapshot.
    pub async fn cancel_parent(&self, parent_id: &str, reason: &str) -> JobResult<ParentJob> {
        let parent = {
            let lock = self.parent_lock(parent_id);
            let _guard = lock.lock().await;
            let mut parent = self.load_parent(parent_id).await?;
            match parent.status {
                ParentStatus::Cancelled => return Ok(parent),
                status if status.is_terminal() => {
                    return Err(JobError::InvalidState(format!(
                        "parent job {} is already {}",
                        parent_id,
                        status.as_str()
                    )));
                }
                _ => {}
            }
            parent.status = ParentStatus::Cancelled;
            parent.error = Some(reason.to_string());
            parent.completed_at = Some(Utc::now());
            self.persist_parent(&parent).await?;
            parent
        };
        info!(
            target: "jobs::manager",
            parent_id = %parent_id,
            reason = %reason,
            "Parent job cancelled"
        );
        // Terminal transition: release the chunk bytes right away.
        if let Err(err) = self.gc_sub_jobs(parent_id).await {
            warn!(
                target: "jobs::manager",
                parent_id = %parent_id,
                error = %err,
                "Cleanup after cancellation failed"
            );
        }
        Ok(parent)
    }

    /// Marks the given chunk slots as published to an SSE consumer.
    /// Returns the indices that were newly marked, i.e. the ones this
    /// connection should actually emit.
    pub async fn mark_chunks_streamed(
        &self,
        parent_id: &str,
        indices: &[usize],
    ) -> JobResult<Vec<usize>> {
        let lock = self.parent_lock(parent_id);
        let _guard = lock.lock().await;
        let mut parent = self.load_parent(parent_id).await?;
        let mut newly_marked = Vec::new();
        for &index in indices {
            if let Some(slot) = parent.transcripts.get_mut(index) {
                if !slot.is_empty() && !slot.streamed() {
                    slot.set_streamed();
                    newly_marked.push(index);
                }
            }
        }
        if !newly_marked.is_empty() {
            self.persist_parent(&parent).await?;
        }
        Ok(newly_marked)
    }

    /// Rearms one failed chunk for another processing attempt: the slot is
    /// emptied, its completion bit cleared, and the sub-job reset to
    /// `Uploaded`.
    pub async fn retry_sub_job(&self, parent_id: &str, chunk_index: usize) -> JobResult<SubJob> {
        let lock = self.parent_lock(parent_id);
        let _guard = lock.lock().await;
        let mut parent = self.load_parent(parent_id).await?;
        if parent.is_terminal() {
            return Err(JobError::InvalidState(format!(
                "parent job {} is already {}",
                parent_id,
                parent.status.as_str()
            )));
        }
        let is_failure = matches!(
            parent.transcripts.get(chunk_index),
            Some(ChunkSlot::Failure(_))
        );
        if !is_failure {
            return Err(JobError::InvalidState(format!(
                "chunk {} of parent {} is not in a failed state",
                chunk_index, parent_id
            )));
        }

        let mut target = None;
        for sub_job_id in &parent.sub_jobs {
            let sub_job = self.get_sub_job(sub_job_id).await?;
            if sub_job.chunk_index == chunk_index {
                target = Some(sub_job);
                break;
            }
        }
        let mut sub_job = target.ok_or_else(|| {
            JobError::NotFound(format!(
                "sub-job for chunk {} of parent {}",
                chunk_index, parent_id
            ))
        })?;

        parent.transcripts[chunk_index] = ChunkSlot::Empty;
        if parent.completed_flags.clear(chunk_index) {
            parent.failed_count = parent.failed_count.saturating_sub(1);
        }
        self.persist_parent(&parent).await?;

        sub_job.status = SubJobStatus::Uploaded;
        sub_job.error = None;
        sub_job.retry_count = 0;
        self.save_sub_job(&sub_job).await?;
        info!(
            target: "jobs::manager",
            parent_id = %parent_id,
            chunk_index,
            sub_job_id = %sub_job.id,
            "Chunk rearmed for retry"
        );
        Ok(sub_job)
    }

    /// Deletes all sub-job records and their chunk bytes. Idempotent.
    pub async fn gc_sub_jobs(&self, parent_id: &str) -> JobResult<usize> {
        let lock = self.parent_lock(parent_id);
        let _guard = lock.lock().await;
        let mut parent = self.load_parent(parent_id).await?;
        let sub_job_ids: Vec<SubJobId> = parent.sub_jobs.drain(..).collect();
        let mut removed = 0usize;
        for sub_job_id in &sub_job_ids {
            match self.get_sub_job(sub_job_id).await {
                Ok(sub_job) => {
                    if let Err(err) = self.objects.delete(&sub_job.storage_key).await {
                        warn!(
                            target: "jobs::manager",
                            parent_id = %parent_id,
                            key = %sub_job.storage_key,
                            error = %err,
                            "Failed to delete chunk bytes"
                        );
                    }
                    self.kv
                        .delete(&sub_job_key(sub_job_id))
                        .await
                        .context("failed to delete sub-job record")?;
                    removed += 1;
                }
                Err(JobError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        self.persist_parent(&parent).await?;
        if removed > 0 {
            debug!(
                target: "jobs::manager",
                parent_id = %parent_id,
                removed,
                "Sub-jobs garbage-collected"
            );
        }
        Ok(removed)
    }

    /// Job summaries for listings; never includes inline transcripts.
    pub async fn list_parents(
        &self,
        status: Option<ParentStatus>,
        limit: usize,
    ) -> JobResult<Vec<ParentJobSummary>> {
        let keys = self
            .kv
            .keys_with_prefix("parent/")
            .await
            .context("failed to list parent jobs")?;
        let mut summaries = Vec::new();
        for key in keys {
            let Some(id) = key.strip_prefix("parent/") else {
                continue;
            };
            match self.load_parent(id).await {
                Ok(parent) => {
                    if status.is_none_or(|wanted| parent.status == wanted) {
                        summaries.push(parent.summary());
                    }
                }
                Err(JobError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries.truncate(limit);
        Ok(summaries)
    }

    /// Deletes a parent and everything it owns.
    pub async fn delete_parent(&self, parent_id: &str) -> JobResult<()> {
        self.gc_sub_jobs(parent_id).await?;
        self.kv
            .delete(&parent_key(parent_id))
            .await
            .context("failed to delete parent record")?;
        self.locks.remove(parent_id);
        info!(target: "jobs::manager", parent_id = %parent_id, "Parent job deleted");
        Ok(())
    }

    /// Live record count, surfaced through `/health`.
    pub async fn record_count(&self) -> usize {
        self.kv.len().await
    }
}

/// Builds a chunk result for a successful transcription.
pub fn chunk_result(
    chunk_index: usize,
    byte_range: ByteRange,
    raw_text: String,
    segments: Vec<serde_json::Value>,
    processing_time_ms: u64,
) -> ChunkResult {
    ChunkResult {
        chunk_index,
        byte_range,
        text: raw_text.clone(),
        raw_text,
        corrected_text: None,
        segments,
        processing_time_ms,
        correction_applied: false,
        correction_error: None,
        skipped: false,
        skip_reason: None,
        streamed: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::models::{ChunkingMethod, JobOptions};
    use crate::store::{MemoryKvStore, MemoryObjectStore, chunk_key};
    use bytes::Bytes;

    fn manager() -> (Arc<JobManager>, Arc<MemoryObjectStore>) {
        let kv = Arc::new(MemoryKvStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        (
            JobManager::new(kv, objects.clone(), Duration::from_secs(3600)),
            objects,
        )
    }

    async fn parent_with_chunks(
        manager: &JobManager,
        total_chunks: usize,
    ) -> ParentJob {
        let options = JobOptions::default();
        let job = ParentJob::new(
            "talk.mp3",
            (total_chunks as u64) * 10,
            10,
            total_chunks,
            ChunkingMethod::ByteRange,
            &options,
        );
        manager.create_parent(job).await.unwrap()
    }

    fn result_for(index: usize, text: &str) -> ChunkResult {
        chunk_result(index, ByteRange::new(0, 10), text.to_string(), Vec::new(), 5)
    }

    #[tokio::test]
    async fn upload_marks_are_idempotent_and_flip_status() {
        let (manager, _) = manager();
        let parent = parent_with_chunks(&manager, 3).await;

        let after = manager.mark_chunk_uploaded(&parent.id, 0).await.unwrap();
        assert_eq!(after.status, ParentStatus::Processing);
        assert_eq!(after.uploaded_count, 1);
        assert_eq!(after.upload_progress, 33);

        let again = manager.mark_chunk_uploaded(&parent.id, 0).await.unwrap();
        assert_eq!(again.uploaded_count, 1);
        assert_eq!(
            again.uploaded_count,
            again.uploaded_flags.count_ones()
        );
    }

    #[tokio::test]
    async fn duplicate_completion_does_not_double_count() {
        let (manager, _) = manager();
        let parent = parent_with_chunks(&manager, 3).await;
        for i in 0..3 {
            manager.mark_chunk_uploaded(&parent.id, i).await.unwrap();
        }

        manager
            .process_completed_chunk(&parent.id, result_for(1, "world this is"))
            .await
            .unwrap();
        let after = manager
            .process_completed_chunk(&parent.id, result_for(1, "world this is"))
            .await
            .unwrap();
        assert_eq!(after.completed_count, 1);
        assert_eq!(
            after.completed_count + after.failed_count,
            after.completed_flags.count_ones()
        );
    }

    #[tokio::test]
    async fn empty_unskipped_result_counts_as_failed() {
        let (manager, _) = manager();
        let parent = parent_with_chunks(&manager, 2).await;
        let after = manager
            .process_completed_chunk(&parent.id, result_for(1, "   "))
            .await
            .unwrap();
        assert_eq!(after.completed_count, 0);
        assert_eq!(after.failed_count, 1);
    }

    #[tokio::test]
    async fn assembly_readiness_fires_exactly_once() {
        let (manager, _) = manager();
        let parent = parent_with_chunks(&manager, 2).await;
        manager
            .process_completed_chunk(&parent.id, result_for(0, "a"))
            .await
            .unwrap();
        assert!(!manager.check_ready_for_assembly(&parent.id).await.unwrap());
        manager
            .mark_chunk_failed(&parent.id, 1, "upstream said no")
            .await
            .unwrap();
        assert!(manager.check_ready_for_assembly(&parent.id).await.unwrap());
        assert!(!manager.check_ready_for_assembly(&parent.id).await.unwrap());
        let snapshot = manager.get_parent(&parent.id).await.unwrap();
        assert_eq!(snapshot.status, ParentStatus::Assembling);
    }

    #[tokio::test]
    async fn cancelled_parent_refuses_counter_updates() {
        let (manager, _) = manager();
        let parent = parent_with_chunks(&manager, 5).await;
        for i in 0..3 {
            manager
                .process_completed_chunk(&parent.id, result_for(i, "text"))
                .await
                .unwrap();
        }
        manager
            .cancel_parent(&parent.id, "user request")
            .await
            .unwrap();

        let refused = manager
            .process_completed_chunk(&parent.id, result_for(3, "late"))
            .await;
        assert!(matches!(refused, Err(JobError::InvalidState(_))));
        let snapshot = manager.get_parent(&parent.id).await.unwrap();
        assert_eq!(snapshot.completed_count, 3);
        assert_eq!(snapshot.status, ParentStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (manager, _) = manager();
        let parent = parent_with_chunks(&manager, 2).await;
        let first = manager.cancel_parent(&parent.id, "stop").await.unwrap();
        let second = manager.cancel_parent(&parent.id, "stop again").await.unwrap();
        assert_eq!(second.status, ParentStatus::Cancelled);
        assert_eq!(second.error, first.error);
    }

    #[tokio::test]
    async fn streamed_marking_reports_only_new_indices() {
        let (manager, _) = manager();
        let parent = parent_with_chunks(&manager, 3).await;
        manager
            .process_completed_chunk(&parent.id, result_for(0, "a"))
            .await
            .unwrap();
        manager
            .process_completed_chunk(&parent.id, result_for(1, "b"))
            .await
            .unwrap();

        let first = manager
            .mark_chunks_streamed(&parent.id, &[0, 1, 2])
            .await
            .unwrap();
        assert_eq!(first, vec![0, 1]);
        let second = manager
            .mark_chunks_streamed(&parent.id, &[0, 1, 2])
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn duplicate_completion_preserves_streamed_flag() {
        let (manager, _) = manager();
        let parent = parent_with_chunks(&manager, 2).await;
        manager
            .process_completed_chunk(&parent.id, result_for(0, "a"))
            .await
            .unwrap();
        manager
            .mark_chunks_streamed(&parent.id, &[0])
            .await
            .unwrap();
        manager
            .process_completed_chunk(&parent.id, result_for(0, "a again"))
            .await
            .unwrap();
        let snapshot = manager.get_parent(&parent.id).await.unwrap();
        assert!(snapshot.transcripts[0].streamed());
    }

    #[tokio::test]
    async fn retry_rearms_a_failed_chunk() {
        let (manager, objects) = manager();
        let parent = parent_with_chunks(&manager, 2).await;
        let key = chunk_key(&parent.id, 1, "mp3");
        objects.put(&key, Bytes::from_static(b"xx")).await.unwrap();
        let sub_job = SubJob::new(parent.id.clone(), 1, ByteRange::new(10, 20), key);
        manager.register_sub_job(sub_job).await.unwrap();

        manager
            .mark_chunk_failed(&parent.id, 1, "flaky upstream")
            .await
            .unwrap();
        let rearmed = manager.retry_sub_job(&parent.id, 1).await.unwrap();
        assert_eq!(rearmed.status, SubJobStatus::Uploaded);

        let snapshot = manager.get_parent(&parent.id).await.unwrap();
        assert_eq!(snapshot.failed_count, 0);
        assert!(snapshot.transcripts[1].is_empty());
        assert!(!snapshot.completed_flags.get(1));
    }

    #[tokio::test]
    async fn gc_removes_sub_jobs_and_bytes() {
        let (manager, objects) = manager();
        let parent = parent_with_chunks(&manager, 1).await;
        let key = chunk_key(&parent.id, 0, "mp3");
        objects.put(&key, Bytes::from_static(b"xx")).await.unwrap();
        let sub_job = SubJob::new(parent.id.clone(), 0, ByteRange::new(0, 10), key.clone());
        let sub_job_id = sub_job.id.clone();
        manager.register_sub_job(sub_job).await.unwrap();

        let removed = manager.gc_sub_jobs(&parent.id).await.unwrap();
        assert_eq!(removed, 1);
        assert!(objects.get(&key).await.is_err());
        assert!(matches!(
            manager.get_sub_job(&sub_job_id).await,
            Err(JobError::NotFound(_))
        ));
        let snapshot = manager.get_parent(&parent.id).await.unwrap();
        assert!(snapshot.sub_jobs.is_empty());
    }

    #[tokio::test]
    async fn listing_filters_by_status_and_limits() {
        let (manager, _) = manager();
        let a = parent_with_chunks(&manager, 1).await;
        let _b = parent_with_chunks(&manager, 1).await;
        manager.cancel_parent(&a.id, "stop").await.unwrap();

        let cancelled = manager
            .list_parents(Some(ParentStatus::Cancelled), 10)
            .await
            .unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, a.id);

        let all = manager.list_parents(None, 1).await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
