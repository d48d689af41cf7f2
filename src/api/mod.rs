mod error;
mod handlers;
mod sse;

pub use error::AppError;

use crate::coordinator::UploadCoordinator;
use crate::events::EmitterConfig;
use crate::gate::Gates;
use crate::jobs::manager::JobManager;
use crate::jobs::queue::WorkQueue;
use axum::{
    Router,
    routing::{get, post},
};
use serde::Serialize;
use std::sync::Arc;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<JobManager>,
    pub coordinator: Arc<UploadCoordinator>,
    pub queue: Arc<WorkQueue>,
    pub gates: Arc<Gates>,
    pub emitter_config: EmitterConfig,
}

/// Standard API response envelope.
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    tracing::debug!(target: "api", "Creating API router");

    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Upload intake
        .route("/upload", post(handlers::upload))
        .route(
            "/chunked-upload-stream",
            post(handlers::chunked_upload_stream),
        )
        // Job lifecycle
        .route(
            "/chunked-upload-status",
            get(handlers::chunked_upload_status),
        )
        .route(
            "/chunked-upload-cancel",
            post(handlers::chunked_upload_cancel),
        )
        .route(
            "/chunked-upload-retry",
            post(handlers::chunked_upload_retry),
        )
        .route("/jobs", get(handlers::list_jobs))
        .route("/result", get(handlers::job_result))
        .route("/delete-job", post(handlers::delete_job))
        // Server-Sent Events for per-job progress
        .route("/chunked-stream/:parent_job_id", get(sse::chunked_stream))
        .with_state(state)
}
