use crate::coordinator::IngestReceipt;
use crate::jobs::models::{
    ChunkSlot, CorrectionMode, JobOptions, ParentJobSummary, ParentStatus,
};
use crate::jobs::queue::WorkItem;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Multipart, Query, State};
use axum::debug_handler;
use axum::http::{HeaderMap, header};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{ApiResponse, AppError, AppState};

/// Query options accepted by the raw-body `/upload` path.
#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    pub filename: Option<String>,
    pub chunk_size_mb: Option<u64>,
    pub use_llm: Option<bool>,
    pub llm_mode: Option<String>,
    pub model: Option<String>,
    pub webhook_url: Option<String>,
    pub debug_save_chunks: Option<bool>,
}

/// JSON body for URL ingestion through `/upload`.
#[derive(Debug, Deserialize)]
pub struct UrlUploadRequest {
    pub url: String,
    #[serde(default)]
    pub use_llm: bool,
    pub llm_mode: Option<String>,
    pub model: Option<String>,
    pub webhook_url: Option<String>,
    pub chunk_size_mb: Option<u64>,
    #[serde(default)]
    pub debug_save_chunks: bool,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub job_id: String,
    pub processing_method: crate::jobs::models::ChunkingMethod,
    pub status_url: String,
    pub result_url: String,
}

impl UploadResponse {
    fn from_receipt(receipt: IngestReceipt) -> Self {
        Self {
            status_url: format!(
                "/chunked-upload-status?parent_job_id={}",
                receipt.parent_job_id
            ),
            result_url: format!("/result?job_id={}", receipt.parent_job_id),
            job_id: receipt.parent_job_id,
            processing_method: receipt.chunking_method,
        }
    }
}

fn parse_llm_mode(value: Option<&str>) -> Result<CorrectionMode, AppError> {
    match value {
        None => Ok(CorrectionMode::PerChunk),
        Some(raw) => CorrectionMode::from_str(raw)
            .ok_or_else(|| AppError::BadRequest(format!("invalid llm_mode: {}", raw))),
    }
}

/// Small-file fast path: raw bytes with query options, or a JSON body
/// naming a source URL.
pub async fn upload(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<UploadResponse>>, AppError> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/json"))
        .unwrap_or(false);

    let receipt = if is_json {
        let request: UrlUploadRequest = serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("invalid request body: {}", e)))?;
        let options = JobOptions {
            chunk_size_mb: request.chunk_size_mb.unwrap_or(10),
            use_llm: request.use_llm,
            llm_mode: parse_llm_mode(request.llm_mode.as_deref())?,
            model: request.model,
            webhook_url: request.webhook_url,
            debug_save_chunks: request.debug_save_chunks,
        };
        tracing::info!(target: "api::upload", url = %request.url, "URL upload requested");
        state
            .coordinator
            .ingest_url(&request.url, options)
            .await
            .map_err(|e| AppError::BadRequest(e.to_string()))?
    } else {
        if body.is_empty() {
            return Err(AppError::BadRequest("empty upload body".to_string()));
        }
        let filename = query.filename.clone().unwrap_or_else(|| "upload.bin".to_string());
        let options = JobOptions {
            chunk_size_mb: query.chunk_size_mb.unwrap_or(10),
            use_llm: query.use_llm.unwrap_or(false),
            llm_mode: parse_llm_mode(query.llm_mode.as_deref())?,
            model: query.model.clone(),
            webhook_url: query.webhook_url.clone(),
            debug_save_chunks: query.debug_save_chunks.unwrap_or(false),
        };
        tracing::info!(
            target: "api::upload",
            filename = %filename,
            size = body.len(),
            "Direct upload received"
        );
        state
            .coordinator
            .ingest_bytes(&filename, body, options)
            .await
            .map_err(AppError::Internal)?
    };

    Ok(Json(ApiResponse::success(UploadResponse::from_receipt(
        receipt,
    ))))
}

/// Whole-file chunked path: multipart file plus option parts.
#[debug_handler]
pub async fn chunked_upload_stream(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ApiResponse<IngestReceipt>>, AppError> {
    let mut file: Option<(String, Bytes)> = None;
    let mut options = JobOptions::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field
                    .file_name()
                    .unwrap_or("upload.bin")
                    .to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("failed to read file: {}", e)))?;
                file = Some((filename, data));
            }
            "chunk_size_mb" => {
                let text = field_text(field).await?;
                options.chunk_size_mb = text
                    .parse()
                    .map_err(|_| AppError::BadRequest(format!("invalid chunk_size_mb: {}", text)))?;
            }
            "use_llm" => {
                let text = field_text(field).await?;
                options.use_llm = text
                    .parse()
                    .map_err(|_| AppError::BadRequest(format!("invalid use_llm: {}", text)))?;
            }
            "llm_mode" => {
                let text = field_text(field).await?;
                options.llm_mode = parse_llm_mode(Some(&text))?;
            }
            "model" => options.model = Some(field_text(field).await?),
            "webhook_url" => options.webhook_url = Some(field_text(field).await?),
            "debug_save_chunks" => {
                let text = field_text(field).await?;
                options.debug_save_chunks = text.parse().map_err(|_| {
                    AppError::BadRequest(format!("invalid debug_save_chunks: {}", text))
                })?;
            }
            other => {
                tracing::debug!(target: "api::upload", field = %other, "Ignoring unknown field");
            }
        }
    }

    let (filename, data) =
        file.ok_or_else(|| AppError::BadRequest("missing file part".to_string()))?;
    if data.is_empty() {
        return Err(AppError::BadRequest("empty file part".to_string()));
    }

    let receipt = state
        .coordinator
        .ingest_bytes(&filename, data, options)
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(ApiResponse::success(receipt)))
}

async fn field_text(field: axum::extract::multipart::Field<'_>) -> Result<String, AppError> {
    field
        .text()
        .await
        .map_err(|e| AppError::BadRequest(format!("invalid field value: {}", e)))
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub parent_job_id: String,
}

/// Authoritative snapshot of one parent job; safe to poll.
pub async fn chunked_upload_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<ApiResponse<crate::jobs::models::ParentJob>>, AppError> {
    let parent = state.manager.get_parent(&query.parent_job_id).await?;
    Ok(Json(ApiResponse::success(parent)))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub parent_job_id: String,
    pub reason: Option<String>,
}

pub async fn chunked_upload_cancel(
    State(state): State<AppState>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let reason = request.reason.as_deref().unwrap_or("cancelled by client");
    tracing::info!(
        target: "api::jobs",
        parent_id = %request.parent_job_id,
        reason = %reason,
        "Cancelling job"
    );
    state
        .manager
        .cancel_parent(&request.parent_job_id, reason)
        .await?;
    Ok(Json(ApiResponse::success(json!({ "cancelled": true }))))
}

#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub parent_job_id: String,
    pub chunk_index: usize,
}

/// Rearms one failed chunk and puts it back on the queue.
pub async fn chunked_upload_retry(
    State(state): State<AppState>,
    Json(request): Json<RetryRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let sub_job = state
        .manager
        .retry_sub_job(&request.parent_job_id, request.chunk_index)
        .await?;
    state
        .queue
        .enqueue(WorkItem {
            parent_id: request.parent_job_id.clone(),
            sub_job_id: sub_job.id,
            chunk_index: request.chunk_index,
        })
        .map_err(AppError::Internal)?;
    tracing::info!(
        target: "api::jobs",
        parent_id = %request.parent_job_id,
        chunk_index = request.chunk_index,
        "Chunk retry enqueued"
    );
    Ok(Json(ApiResponse::success(json!({ "retried": true }))))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<ApiResponse<Vec<ParentJobSummary>>>, AppError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(
            ParentStatus::from_str(raw)
                .ok_or_else(|| AppError::BadRequest(format!("invalid status: {}", raw)))?,
        ),
    };
    let summaries = state
        .manager
        .list_parents(status, query.limit.unwrap_or(50))
        .await?;
    Ok(Json(ApiResponse::success(summaries)))
}

#[derive(Debug, Deserialize)]
pub struct ResultQuery {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct ResultResponse {
    pub job_id: String,
    pub filename: String,
    pub status: ParentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_transcript: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_transcript: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrected_transcript: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assembly_method: Option<crate::jobs::models::AssemblyMethod>,
    pub success_rate: u8,
    pub total_chunks: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub chunks: Vec<ChunkSlot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Full transcript plus per-chunk data; 409 while still processing.
pub async fn job_result(
    State(state): State<AppState>,
    Query(query): Query<ResultQuery>,
) -> Result<Json<ApiResponse<ResultResponse>>, AppError> {
    let parent = state.manager.get_parent(&query.job_id).await?;
    if !parent.is_terminal() {
        return Err(AppError::Conflict(format!(
            "job {} is still {}",
            parent.id,
            parent.status.as_str()
        )));
    }
    let response = ResultResponse {
        job_id: parent.id.clone(),
        filename: parent.filename.clone(),
        status: parent.status,
        final_transcript: parent.final_transcript.clone(),
        raw_transcript: parent.raw_transcript.clone(),
        corrected_transcript: parent.corrected_transcript.clone(),
        assembly_method: parent.assembly_method,
        success_rate: parent.success_rate,
        total_chunks: parent.total_chunks,
        completed_count: parent.completed_count,
        failed_count: parent.failed_count,
        skipped_count: parent.skipped_count(),
        chunks: parent.transcripts.clone(),
        error: parent.error.clone(),
    };
    Ok(Json(ApiResponse::success(response)))
}

#[derive(Debug, Deserialize)]
pub struct DeleteJobRequest {
    pub job_id: String,
}

/// Deletes a job and cascades to its sub-jobs and chunk bytes.
pub async fn delete_job(
    State(state): State<AppState>,
    Json(request): Json<DeleteJobRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    state.manager.delete_parent(&request.job_id).await?;
    Ok(Json(ApiResponse::success(json!({ "deleted": true }))))
}

/// Readiness snapshot with gate introspection.
pub async fn health_check(
    State(state): State<AppState>,
) -> Json<ApiResponse<serde_json::Value>> {
    tracing::debug!(target: "api::health", "Health check requested");
    Json(ApiResponse::success(json!({
        "status": "healthy",
        "service": "chunkscribe",
        "gates": state.gates.status(),
        "records": state.manager.record_count().await,
        "workers": {
            "inflight": state.queue.inflight(),
            "max_concurrent": state.queue.max_concurrent(),
        },
    })))
}
