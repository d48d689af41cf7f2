//! Processing of a single chunk: fetch bytes, transcribe, optionally
//! correct, persist the result.

use crate::gate::{Gates, Limiter};
use crate::jobs::manager::{JobManager, chunk_result};
use crate::jobs::models::{ChunkResult, CorrectionMode, ParentJob, SubJob, SubJobStatus};
use crate::store::ObjectStore;
use crate::upstream::{
    RetryPolicy, SpeechToText, TextCorrection, UpstreamError, retry,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Per-chunk correction is skipped for texts below this length; there is
/// nothing worth rewriting in a couple of words.
const MIN_CORRECTION_CHARS: usize = 10;

#[derive(Error, Debug)]
pub enum ProcessError {
    /// The sub-job was not in a processable state; a programming error in
    /// the caller, never retried.
    #[error("sub-job {sub_job_id} is in state {status:?}, expected uploaded or failed")]
    NotProcessable {
        sub_job_id: String,
        status: SubJobStatus,
    },
    #[error(transparent)]
    Upstream(UpstreamError),
    /// Blank transcription on a chunk that is not header-only.
    #[error("chunk produced no text")]
    NoText,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProcessError {
    /// Whether the queue worker may schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessError::Upstream(err) => err.is_retryable(),
            // Storage reads are transient by the same taxonomy.
            ProcessError::Other(_) => true,
            ProcessError::NotProcessable { .. } | ProcessError::NoText => false,
        }
    }
}

pub struct ChunkProcessor {
    manager: Arc<JobManager>,
    objects: Arc<dyn ObjectStore>,
    transcriber: Arc<dyn SpeechToText>,
    corrector: Arc<dyn TextCorrection>,
    gates: Arc<Gates>,
    transcription_policy: RetryPolicy,
    correction_policy: RetryPolicy,
}

impl ChunkProcessor {
    pub fn new(
        manager: Arc<JobManager>,
        objects: Arc<dyn ObjectStore>,
        transcriber: Arc<dyn SpeechToText>,
        corrector: Arc<dyn TextCorrection>,
        gates: Arc<Gates>,
    ) -> Self {
        Self {
            manager,
            objects,
            transcriber,
            corrector,
            gates,
            transcription_policy: RetryPolicy::transcription(),
            correction_policy: RetryPolicy::correction(),
        }
    }

    /// Runs one chunk end to end and returns its result. The sub-job
    /// record tracks state transitions; the caller owns parent-side
    /// accounting.
    pub async fn process(
        &self,
        sub_job_id: &str,
        parent: &ParentJob,
    ) -> Result<ChunkResult, ProcessError> {
        let mut sub_job = self.manager.get_sub_job(sub_job_id).await.map_err(|e| {
            ProcessError::Other(anyhow::anyhow!(e))
        })?;
        if !sub_job.can_process() {
            return Err(ProcessError::NotProcessable {
                sub_job_id: sub_job.id.clone(),
                status: sub_job.status,
            });
        }

        sub_job.status = SubJobStatus::Processing;
        sub_job.processing_started_at = Some(Utc::now());
        self.save(&sub_job).await?;
        let started = Instant::now();

        match self.run(&mut sub_job, parent, started).await {
            Ok(result) => {
                sub_job.status = SubJobStatus::Done;
                sub_job.completed_at = Some(Utc::now());
                sub_job.error = None;
                self.save(&sub_job).await?;
                Ok(result)
            }
            Err(err) => {
                sub_job.status = SubJobStatus::Failed;
                sub_job.error = Some(err.to_string());
                self.save(&sub_job).await?;
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        sub_job: &mut SubJob,
        parent: &ParentJob,
        started: Instant,
    ) -> Result<ChunkResult, ProcessError> {
        // Chunks are bounded by the target chunk size, so pulling the
        // whole chunk into memory is bounded too.
        let audio = self
            .objects
            .get(&sub_job.storage_key)
            .await
            .map_err(ProcessError::Other)?;

        let filename = sub_job
            .storage_key
            .rsplit('/')
            .next()
            .unwrap_or("chunk.bin")
            .to_string();
        let model = parent.model.clone();

        debug!(
            target: "processor",
            sub_job_id = %sub_job.id,
            parent_id = %sub_job.parent_id,
            chunk_index = sub_job.chunk_index,
            size = audio.len(),
            "Transcribing chunk"
        );

        let transcriber = Arc::clone(&self.transcriber);
        let gates = Arc::clone(&self.gates);
        let transcription = retry(self.transcription_policy, "transcribe_chunk", || {
            let transcriber = Arc::clone(&transcriber);
            let gates = Arc::clone(&gates);
            let audio = audio.clone();
            let filename = filename.clone();
            let model = model.clone();
            async move {
                gates
                    .run(
                        Limiter::Transcription,
                        transcriber.transcribe(audio, &filename, model.as_deref()),
                    )
                    .await
            }
        })
        .await
        .map_err(ProcessError::Upstream)?;

        if transcription.text.trim().is_empty() {
            // The first chunk of a container often holds only headers and
            // metadata; an empty transcript there is expected, anywhere
            // else it is a failure.
            if sub_job.chunk_index == 0 {
                info!(
                    target: "processor",
                    sub_job_id = %sub_job.id,
                    parent_id = %sub_job.parent_id,
                    "First chunk transcribed empty, marking header-only"
                );
                return Ok(ChunkResult::skipped(
                    sub_job.chunk_index,
                    sub_job.byte_range,
                    "header-only",
                ));
            }
            return Err(ProcessError::NoText);
        }

        let mut result = chunk_result(
            sub_job.chunk_index,
            sub_job.byte_range,
            transcription.text,
            transcription.segments,
            started.elapsed().as_millis() as u64,
        );

        if parent.use_correction
            && parent.correction_mode == CorrectionMode::PerChunk
            && result.raw_text.len() >= MIN_CORRECTION_CHARS
        {
            self.correct_in_place(&mut result, parent).await;
        }

        result.processing_time_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }

    /// Per-chunk correction. Failures fall back to the raw text and never
    /// fail the chunk.
    async fn correct_in_place(&self, result: &mut ChunkResult, parent: &ParentJob) {
        let corrector = Arc::clone(&self.corrector);
        let gates = Arc::clone(&self.gates);
        let raw = result.raw_text.clone();
        let model = parent.model.clone();
        let outcome = retry(self.correction_policy, "correct_chunk", || {
            let corrector = Arc::clone(&corrector);
            let gates = Arc::clone(&gates);
            let raw = raw.clone();
            let model = model.clone();
            async move {
                gates
                    .run(Limiter::Correction, corrector.correct(&raw, model.as_deref()))
                    .await
            }
        })
        .await;

        match outcome {
            Ok(corrected) => {
                result.text = corrected.clone();
                result.corrected_text = Some(corrected);
                result.correction_applied = true;
            }
            Err(err) => {
                warn!(
                    target: "processor",
                    parent_id = %parent.id,
                    chunk_index = result.chunk_index,
                    error = %err,
                    "Chunk correction failed, keeping raw text"
                );
                result.correction_applied = false;
                result.correction_error = Some(err.to_string());
            }
        }
    }

    async fn save(&self, sub_job: &SubJob) -> Result<(), ProcessError> {
        self.manager
            .save_sub_job(sub_job)
            .await
            .map_err(|e| ProcessError::Other(anyhow::anyhow!(e)))
    }
}
