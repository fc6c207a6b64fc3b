//! API error type and HTTP mapping.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::api::types::ApiErrorResponse;
use crate::runtime::RuntimeError;

/// Errors returned by API handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or invalid request.
    #[error("{0}")]
    BadRequest(String),

    /// Unexpected server-side failure.
    #[error("{0}")]
    Internal(String),

    /// Runtime controller failure.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl ApiError {
    /// Wrap any displayable error as an internal error.
    pub fn internal(e: impl std::fmt::Display) -> Self {
        ApiError::Internal(e.to_string())
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Runtime(e) => match e {
                RuntimeError::InvalidTransition(_) => StatusCode::BAD_REQUEST,
                RuntimeError::NotFound(_) => StatusCode::NOT_FOUND,
                RuntimeError::DuplicateRequest { .. }
                | RuntimeError::VmExists(_)
                | RuntimeError::Superseded => StatusCode::CONFLICT,
                RuntimeError::QuiescenceTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
                RuntimeError::QuiescenceFailed(_) | RuntimeError::DeliveryFailed { .. } => {
                    StatusCode::BAD_GATEWAY
                }
                RuntimeError::ReclaimFailed(_)
                | RuntimeError::PauseFailed(_)
                | RuntimeError::ResumeFailed(_)
                | RuntimeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "INVALID_REQUEST",
            ApiError::Internal(_) => "INTERNAL",
            ApiError::Runtime(e) => e.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        } else {
            tracing::debug!(code = self.code(), error = %self, "request rejected");
        }
        let body = ApiErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}
