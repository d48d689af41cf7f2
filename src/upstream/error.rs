//! Failure taxonomy for upstream HTTP calls. Every error crossing the
//! upstream boundary is classified as retryable or terminal before it
//! propagates; the retry envelope keys off that split.

use reqwest::StatusCode;
use thiserror::Error;

/// Classified upstream failure.
#[derive(Error, Debug, Clone)]
pub enum UpstreamError {
    /// Transient: timeouts, connection resets, 408/429/5xx. Worth retrying.
    #[error("retryable upstream error{}: {message}", fmt_status(.status))]
    Retryable {
        status: Option<u16>,
        message: String,
    },

    /// Permanent: bad request, auth, unsupported format, malformed body.
    /// Retrying cannot help; the failure is re-raised to the caller.
    #[error("terminal upstream error{}: {message}", fmt_status(.status))]
    Terminal {
        status: Option<u16>,
        message: String,
    },
}

fn fmt_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {})", code),
        None => String::new(),
    }
}

impl UpstreamError {
    pub fn retryable(message: impl Into<String>) -> Self {
        UpstreamError::Retryable {
            status: None,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        UpstreamError::Terminal {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, UpstreamError::Retryable { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::Retryable { status, .. } | UpstreamError::Terminal { status, .. } => {
                *status
            }
        }
    }

    /// Classifies an HTTP status plus response body excerpt.
    pub fn from_status(status: StatusCode, body: impl Into<String>) -> Self {
        let message = body.into();
        if status_is_retryable(status) {
            UpstreamError::Retryable {
                status: Some(status.as_u16()),
                message,
            }
        } else {
            UpstreamError::Terminal {
                status: Some(status.as_u16()),
                message,
            }
        }
    }
}

/// 408, 429, and the transient 5xx family are retryable; every other
/// non-success status is terminal.
pub fn status_is_retryable(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        // Transport-level failures (DNS, connect, timeout) are transient;
        // a body we could not decode is not going to parse on a retry.
        if err.is_timeout() || err.is_connect() || err.is_request() {
            UpstreamError::Retryable {
                status: err.status().map(|s| s.as_u16()),
                message: err.to_string(),
            }
        } else if err.is_decode() || err.is_body() {
            UpstreamError::Terminal {
                status: err.status().map(|s| s.as_u16()),
                message: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            UpstreamError::from_status(status, err.to_string())
        } else {
            UpstreamError::Retryable {
                status: None,
                message: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses_are_retryable() {
        for code in [408u16, 429, 500, 502, 503, 504] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(status_is_retryable(status), "HTTP {} should retry", code);
            assert!(UpstreamError::from_status(status, "x").is_retryable());
        }
    }

    #[test]
    fn client_errors_are_terminal() {
        for code in [400u16, 401, 403, 404, 413, 415, 422] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(!status_is_retryable(status), "HTTP {} is terminal", code);
            assert!(!UpstreamError::from_status(status, "x").is_retryable());
        }
    }

    #[test]
    fn display_includes_status() {
        let err = UpstreamError::from_status(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("slow down"));
    }
}
