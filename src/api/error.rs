use crate::jobs::manager::JobError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use super::ApiResponse;

/// API-surface error; each variant maps to one HTTP status.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<JobError> for AppError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(message) => AppError::NotFound(message),
            JobError::InvalidState(message) => AppError::Conflict(message),
            JobError::Storage(inner) => AppError::Internal(inner),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message.clone()),
            AppError::NotFound(message) => (StatusCode::NOT_FOUND, message.clone()),
            AppError::Conflict(message) => (StatusCode::CONFLICT, message.clone()),
            AppError::Internal(inner) => {
                tracing::error!(target: "api::error", error = ?inner, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        if status != StatusCode::INTERNAL_SERVER_ERROR {
            tracing::warn!(
                target: "api::error",
                status = status.as_u16(),
                message = %message,
                "Request failed"
            );
        }
        (status, Json(ApiResponse::<()>::error(message))).into_response()
    }
}
