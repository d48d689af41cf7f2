//! Per-parent SSE emitter.
//!
//! One emitter task per connection polls the authoritative parent snapshot
//! on a fixed tick and publishes whatever changed. Chunk events are
//! deduplicated across connections through the per-slot `streamed` flag,
//! which is set under the parent lock after publish; a reconnect therefore
//! replays exactly the chunks that were never delivered.

use crate::assembler::{PartialTranscript, contiguous_prefix};
use crate::jobs::manager::JobManager;
use crate::jobs::models::{ChunkSlot, ParentJob, ParentStatus};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Poll interval; also the heartbeat cadence.
    pub tick: Duration,
    /// Hard cap on one connection's lifetime.
    pub max_duration: Duration,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(2),
            max_duration: Duration::from_secs(30 * 60),
        }
    }
}

/// Events published on the per-parent stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Initialized {
        parent_job_id: String,
        filename: String,
        status: ParentStatus,
        total_chunks: usize,
        total_size_bytes: u64,
        use_correction: bool,
        correction_mode: crate::jobs::models::CorrectionMode,
        progress: u8,
    },
    ProgressUpdate {
        parent_job_id: String,
        status: ParentStatus,
        progress: u8,
        upload_progress: u8,
        processing_progress: u8,
        uploaded_count: usize,
        completed_count: usize,
        failed_count: usize,
        success_rate: u8,
    },
    ChunkComplete {
        parent_job_id: String,
        chunk_index: usize,
        text: String,
        raw_text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        corrected_text: Option<String>,
        processing_time_ms: u64,
        correction_applied: bool,
        skipped: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        skip_reason: Option<String>,
    },
    ChunkFailed {
        parent_job_id: String,
        chunk_index: usize,
        error: String,
    },
    PartialTranscript {
        parent_job_id: String,
        partial_transcript: String,
        last_index: usize,
    },
    LlmError {
        parent_job_id: String,
        error: String,
    },
    FinalResult {
        parent_job_id: String,
        status: ParentStatus,
        final_transcript: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        raw_transcript: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        corrected_transcript: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        assembly_method: Option<crate::jobs::models::AssemblyMethod>,
        success_rate: u8,
    },
    JobTerminated {
        parent_job_id: String,
        status: ParentStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        partial_results: PartialTranscript,
    },
    StreamError {
        parent_job_id: String,
        error: String,
    },
    StreamTimeout {
        parent_job_id: String,
    },
}

impl StreamEvent {
    /// Wire envelope: the tagged event payload plus an ISO-8601 timestamp.
    pub fn envelope(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        if let Some(object) = value.as_object_mut() {
            object.insert("timestamp".to_string(), json!(Utc::now()));
        }
        value
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Initialized { .. } => "initialized",
            StreamEvent::ProgressUpdate { .. } => "progress_update",
            StreamEvent::ChunkComplete { .. } => "chunk_complete",
            StreamEvent::ChunkFailed { .. } => "chunk_failed",
            StreamEvent::PartialTranscript { .. } => "partial_transcript",
            StreamEvent::LlmError { .. } => "llm_error",
            StreamEvent::FinalResult { .. } => "final_result",
            StreamEvent::JobTerminated { .. } => "job_terminated",
            StreamEvent::StreamError { .. } => "stream_error",
            StreamEvent::StreamTimeout { .. } => "stream_timeout",
        }
    }
}

fn progress_event(parent: &ParentJob) -> StreamEvent {
    StreamEvent::ProgressUpdate {
        parent_job_id: parent.id.clone(),
        status: parent.status,
        progress: parent.progress,
        upload_progress: parent.upload_progress,
        processing_progress: parent.processing_progress,
        uploaded_count: parent.uploaded_count,
        completed_count: parent.completed_count,
        failed_count: parent.failed_count,
        success_rate: parent.success_rate,
    }
}

fn chunk_event(parent_id: &str, slot: &ChunkSlot) -> Option<StreamEvent> {
    match slot {
        ChunkSlot::Result(result) => Some(StreamEvent::ChunkComplete {
            parent_job_id: parent_id.to_string(),
            chunk_index: result.chunk_index,
            text: result.text.clone(),
            raw_text: result.raw_text.clone(),
            corrected_text: result.corrected_text.clone(),
            processing_time_ms: result.processing_time_ms,
            correction_applied: result.correction_applied,
            skipped: result.skipped,
            skip_reason: result.skip_reason.clone(),
        }),
        ChunkSlot::Failure(failure) => Some(StreamEvent::ChunkFailed {
            parent_job_id: parent_id.to_string(),
            chunk_index: failure.chunk_index,
            error: failure.error.clone(),
        }),
        ChunkSlot::Empty => None,
    }
}

/// Spawns the emitter task for one connection. Events flow through `tx`;
/// the task ends on terminal state, timeout, snapshot loss, or when the
/// consumer goes away.
pub fn spawn_emitter(
    manager: Arc<JobManager>,
    parent_id: String,
    config: EmitterConfig,
    tx: mpsc::Sender<StreamEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        info!(target: "events", parent_id = %parent_id, "SSE emitter started");

        let parent = match manager.get_parent(&parent_id).await {
            Ok(parent) => parent,
            Err(err) => {
                let _ = tx
                    .send(StreamEvent::StreamError {
                        parent_job_id: parent_id.clone(),
                        error: err.to_string(),
                    })
                    .await;
                return;
            }
        };
        let initialized = StreamEvent::Initialized {
            parent_job_id: parent.id.clone(),
            filename: parent.filename.clone(),
            status: parent.status,
            total_chunks: parent.total_chunks,
            total_size_bytes: parent.total_size_bytes,
            use_correction: parent.use_correction,
            correction_mode: parent.correction_mode,
            progress: parent.progress,
        };
        if tx.send(initialized).await.is_err() {
            return;
        }

        let mut last_progress: Option<Value> = None;
        let mut last_partial_index: Option<usize> = None;
        let mut llm_error_sent = false;

        loop {
            if started.elapsed() >= config.max_duration {
                let _ = tx
                    .send(StreamEvent::StreamTimeout {
                        parent_job_id: parent_id.clone(),
                    })
                    .await;
                warn!(target: "events", parent_id = %parent_id, "SSE connection hit hard cap");
                return;
            }
            tokio::time::sleep(config.tick).await;

            let parent = match manager.get_parent(&parent_id).await {
                Ok(parent) => parent,
                Err(err) => {
                    let _ = tx
                        .send(StreamEvent::StreamError {
                            parent_job_id: parent_id.clone(),
                            error: err.to_string(),
                        })
                        .await;
                    return;
                }
            };

            // Progress, only when the snapshot actually moved.
            let progress = progress_event(&parent);
            let progress_value = serde_json::to_value(&progress).ok();
            if progress_value != last_progress {
                last_progress = progress_value;
                if tx.send(progress).await.is_err() {
                    return;
                }
            }

            // Chunk completions not yet published anywhere. The streamed
            // flag is claimed first, under the parent lock, so two
            // concurrent connections never double-publish.
            let pending: Vec<usize> = parent
                .transcripts
                .iter()
                .enumerate()
                .filter(|(_, slot)| !slot.is_empty() && !slot.streamed())
                .map(|(index, _)| index)
                .collect();
            if !pending.is_empty() {
                match manager.mark_chunks_streamed(&parent_id, &pending).await {
                    Ok(claimed) => {
                        for index in claimed {
                            if let Some(event) = chunk_event(&parent_id, &parent.transcripts[index])
                            {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        debug!(
                            target: "events",
                            parent_id = %parent_id,
                            error = %err,
                            "Failed to claim chunk events"
                        );
                    }
                }
            }

            // Rolling partial transcript, whenever the contiguous prefix
            // grows.
            let partial = contiguous_prefix(&parent.transcripts);
            if partial.last_index > last_partial_index {
                last_partial_index = partial.last_index;
                if let Some(last_index) = partial.last_index {
                    let event = StreamEvent::PartialTranscript {
                        parent_job_id: parent_id.clone(),
                        partial_transcript: partial.text,
                        last_index,
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }

            if let Some(error) = parent.llm_error.clone() {
                if !llm_error_sent {
                    llm_error_sent = true;
                    let event = StreamEvent::LlmError {
                        parent_job_id: parent_id.clone(),
                        error,
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }

            if parent.is_terminal() {
                let terminal = match parent.status {
                    ParentStatus::Done => StreamEvent::FinalResult {
                        parent_job_id: parent.id.clone(),
                        status: parent.status,
                        final_transcript: parent.final_transcript.clone().unwrap_or_default(),
                        raw_transcript: parent.raw_transcript.clone(),
                        corrected_transcript: parent.corrected_transcript.clone(),
                        assembly_method: parent.assembly_method,
                        success_rate: parent.success_rate,
                    },
                    _ => StreamEvent::JobTerminated {
                        parent_job_id: parent.id.clone(),
                        status: parent.status,
                        reason: parent.error.clone(),
                        partial_results: contiguous_prefix(&parent.transcripts),
                    },
                };
                let _ = tx.send(terminal).await;
                info!(
                    target: "events",
                    parent_id = %parent_id,
                    status = parent.status.as_str(),
                    "SSE emitter finished"
                );
                return;
            }
        }
    })
}
