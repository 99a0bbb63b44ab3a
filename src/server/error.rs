//! HTTP error mapping.
//!
//! Every [`GatewayError`] maps to exactly one status code and a JSON body of
//! the shape `{"error": "...", "code": "...", "job_id"?: "...", "reason"?: "..."}`.
//! `reason` is the engine failure's sub-reason, present only for `ENGINE_ERROR`.

use crate::error::{GatewayError, ValidationError};
use crate::job::JobId;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Client closed the connection before the response (nginx convention).
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Application-level error type for HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// A failure from the orchestration core, tagged with its job when known.
    #[error("{error}")]
    Gateway {
        error: GatewayError,
        job_id: Option<JobId>,
    },

    /// Malformed request that never became a job.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Unknown or expired job.
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Convenience type alias for handler return values.
pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn for_job(error: GatewayError, job_id: JobId) -> Self {
        ApiError::Gateway {
            error,
            job_id: Some(job_id),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Gateway { error, .. } => gateway_status(error),
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        ApiError::Gateway {
            error,
            job_id: None,
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(error: ValidationError) -> Self {
        GatewayError::from(error).into()
    }
}

fn gateway_status(error: &GatewayError) -> StatusCode {
    match error {
        GatewayError::Validation(v) => match v {
            ValidationError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ValidationError::Empty { .. } => StatusCode::BAD_REQUEST,
            ValidationError::UnsupportedType { .. } | ValidationError::ContentMismatch { .. } => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            ValidationError::MissingFile => StatusCode::UNPROCESSABLE_ENTITY,
        },
        GatewayError::ResourceExhausted(_) => StatusCode::INSUFFICIENT_STORAGE,
        GatewayError::ServiceBusy { .. } => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::Engine(_) => StatusCode::BAD_GATEWAY,
        GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::Cancelled => {
            StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
        }
        GatewayError::InvalidConfig(_) | GatewayError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (code, message, job_id, reason) = match &self {
            ApiError::Gateway { error, job_id } => {
                if status.is_server_error() {
                    tracing::error!(error = %error, job_id = ?job_id, "Request failed");
                }
                let reason = match error {
                    GatewayError::Engine(failure) => Some(failure.reason()),
                    _ => None,
                };
                (error.kind().as_str(), error.to_string(), *job_id, reason)
            }
            ApiError::BadRequest(msg) => ("BAD_REQUEST", msg.clone(), None, None),
            ApiError::NotFound(msg) => ("NOT_FOUND", msg.clone(), None, None),
        };

        let mut body = json!({ "error": message, "code": code });
        if let Some(id) = job_id {
            body["job_id"] = json!(id);
        }
        if let Some(reason) = reason {
            body["reason"] = json!(reason);
        }

        (status, axum::Json(body)).into_response()
    }
}
