//! Upload intake: splits incoming bytes, stores the chunks, creates the
//! parent and its sub-jobs, and enqueues processing work.

use crate::chunker::Chunker;
use crate::gate::{Gates, Limiter};
use crate::jobs::manager::JobManager;
use crate::jobs::models::{
    ChunkingMethod, JobOptions, ParentJob, SubJob, SubJobStatus,
};
use crate::jobs::queue::{WorkItem, WorkQueue};
use crate::store::{ObjectStore, chunk_key, debug_chunk_key};
use anyhow::{Context, Result, bail};
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Returned to the client when a chunked upload is accepted.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub parent_job_id: String,
    pub stream_url: String,
    pub total_chunks: usize,
    pub chunking_method: ChunkingMethod,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Overlap applied by the byte splitter, as a percent of the chunk.
    pub overlap_percent: u64,
    /// Upper bound on the overlap in bytes.
    pub overlap_cap_bytes: u64,
    /// Bounded timeout for URL ingestion downloads.
    pub url_fetch_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            overlap_percent: 5,
            overlap_cap_bytes: 50 * 1024,
            url_fetch_timeout: Duration::from_secs(30),
        }
    }
}

pub struct UploadCoordinator {
    manager: Arc<JobManager>,
    objects: Arc<dyn ObjectStore>,
    queue: Arc<WorkQueue>,
    gates: Arc<Gates>,
    http: reqwest::Client,
    config: CoordinatorConfig,
}

impl UploadCoordinator {
    pub fn new(
        manager: Arc<JobManager>,
        objects: Arc<dyn ObjectStore>,
        queue: Arc<WorkQueue>,
        gates: Arc<Gates>,
        http: reqwest::Client,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            manager,
            objects,
            queue,
            gates,
            http,
            config,
        }
    }

    /// Whole-file intake: chunk, store, create the job tree, enqueue.
    pub async fn ingest_bytes(
        &self,
        filename: &str,
        data: Bytes,
        options: JobOptions,
    ) -> Result<IngestReceipt> {
        if data.is_empty() {
            bail!("empty upload");
        }
        let total_size = data.len() as u64;
        let target = options.target_chunk_size_bytes();
        let chunker = Chunker::new(target)
            .with_overlap(self.config.overlap_percent, self.config.overlap_cap_bytes);
        let plan = chunker.split(data, filename);
        let ext = extension_of(filename);

        let parent = self
            .manager
            .create_parent(ParentJob::new(
                filename,
                total_size,
                target,
                plan.chunks.len(),
                plan.method,
                &options,
            ))
            .await?;

        info!(
            target: "coordinator",
            parent_id = %parent.id,
            filename = %filename,
            total_size,
            total_chunks = plan.chunks.len(),
            method = ?plan.method,
            "Accepted chunked upload"
        );

        // Sub-job fan-out runs under the job-spawn gate so one huge file
        // cannot monopolize intake.
        let parent_id = parent.id.clone();
        self.gates
            .run(Limiter::JobSpawn, async {
                for chunk in &plan.chunks {
                    let key = chunk_key(&parent_id, chunk.index, &ext);
                    self.objects
                        .put(&key, chunk.bytes.clone())
                        .await
                        .with_context(|| format!("failed to store chunk {}", chunk.index))?;
                    if parent.debug_save_chunks {
                        let mirror = debug_chunk_key(&parent_id, chunk.index, &ext);
                        self.objects
                            .put(&mirror, chunk.bytes.clone())
                            .await
                            .with_context(|| {
                                format!("failed to mirror chunk {}", chunk.index)
                            })?;
                    }

                    let mut sub_job =
                        SubJob::new(parent_id.clone(), chunk.index, chunk.range, key);
                    sub_job.status = SubJobStatus::Uploaded;
                    sub_job.uploaded_at = Some(Utc::now());
                    let sub_job = self.manager.register_sub_job(sub_job).await?;
                    self.manager
                        .mark_chunk_uploaded(&parent_id, chunk.index)
                        .await?;

                    self.queue.enqueue(WorkItem {
                        parent_id: parent_id.clone(),
                        sub_job_id: sub_job.id,
                        chunk_index: chunk.index,
                    })?;
                    debug!(
                        target: "coordinator",
                        parent_id = %parent_id,
                        chunk_index = chunk.index,
                        size = chunk.bytes.len(),
                        "Chunk stored and enqueued"
                    );
                }
                Ok::<(), anyhow::Error>(())
            })
            .await?;

        Ok(IngestReceipt {
            stream_url: format!("/chunked-stream/{}", parent.id),
            parent_job_id: parent.id,
            total_chunks: plan.chunks.len(),
            chunking_method: plan.method,
        })
    }

    /// URL intake: streaming download with a bounded timeout, then the
    /// whole-file path.
    pub async fn ingest_url(&self, url: &str, options: JobOptions) -> Result<IngestReceipt> {
        let parsed = url::Url::parse(url).context("invalid source url")?;
        if !matches!(parsed.scheme(), "http" | "https") {
            bail!("unsupported url scheme: {}", parsed.scheme());
        }
        let filename = parsed
            .path_segments()
            .and_then(|segments| segments.last())
            .filter(|segment| !segment.is_empty())
            .unwrap_or("download.bin")
            .to_string();

        info!(target: "coordinator", url = %url, filename = %filename, "Downloading source url");
        let response = self
            .http
            .get(parsed)
            .timeout(self.config.url_fetch_timeout)
            .send()
            .await
            .context("failed to fetch source url")?;
        if !response.status().is_success() {
            bail!("source url returned HTTP {}", response.status().as_u16());
        }
        let data = response
            .bytes()
            .await
            .context("failed to read source url body")?;

        self.ingest_bytes(&filename, data, options).await
    }
}

fn extension_of(filename: &str) -> String {
    let ext = filename.rsplit('.').next().unwrap_or_default();
    if ext.is_empty() || ext == filename {
        "bin".to_string()
    } else {
        ext.to_ascii_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_falls_back_to_bin() {
        assert_eq!(extension_of("talk.MP3"), "mp3");
        assert_eq!(extension_of("noext"), "bin");
        assert_eq!(extension_of(""), "bin");
    }
}
