//! Failure envelope for every route.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use runlet_core::{ExecutionError, StoreError};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Malformed request body or query string.
    #[error("{0}")]
    InvalidInput(String),

    #[error("procedure not found: {0}")]
    ProcedureNotFound(String),

    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid admin token")]
    InvalidToken,

    #[error("internal error: {0}")]
    Internal(String),

    /// Plain-text reply from the framework or a middleware layer.
    #[error("{message}")]
    Rejected { status: StatusCode, message: String },
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Execution(ExecutionError::EmptyScript) | Self::InvalidInput(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::Execution(err) if err.is_abnormal_termination() => StatusCode::REQUEST_TIMEOUT,
            Self::Store(err) if err.is_input_error() => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ProcedureNotFound(_) => StatusCode::NOT_FOUND,
            Self::MissingToken => StatusCode::BAD_REQUEST,
            Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::Execution(_) | Self::Store(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Rejected { status, .. } => *status,
        }
    }

    /// Stable machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Execution(err) => err.kind(),
            Self::Store(err) => err.kind(),
            Self::InvalidInput(_) => "InputError",
            Self::ProcedureNotFound(_) => "NotFound",
            Self::MissingToken | Self::InvalidToken => "AuthError",
            Self::Internal(_) => "Panic",
            Self::Rejected { status, .. } => match *status {
                StatusCode::REQUEST_TIMEOUT => "Timeout",
                StatusCode::NOT_FOUND => "NotFound",
                status if status.is_server_error() => "Panic",
                _ => "InputError",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "Request failed");
        } else {
            tracing::debug!(
                kind = self.kind(),
                error = %self,
                status = %status,
                "Request rejected"
            );
        }
        let body = json!({
            "success": false,
            "error": self.to_string(),
            "kind": self.kind(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::from(ExecutionError::EmptyScript), StatusCode::UNPROCESSABLE_ENTITY),
            (
                ApiError::from(ExecutionError::Timeout { budget_secs: 1 }),
                StatusCode::REQUEST_TIMEOUT,
            ),
            (
                ApiError::from(ExecutionError::Panic("boom".into())),
                StatusCode::REQUEST_TIMEOUT,
            ),
            (
                ApiError::from(ExecutionError::Syntax("bad".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ApiError::from(StoreError::QuerySyntax("bad".into())),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ApiError::from(StoreError::Write("disk".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (ApiError::ProcedureNotFound("x".into()), StatusCode::NOT_FOUND),
            (ApiError::MissingToken, StatusCode::BAD_REQUEST),
            (ApiError::InvalidToken, StatusCode::UNAUTHORIZED),
            (
                ApiError::Rejected {
                    status: StatusCode::PAYLOAD_TOO_LARGE,
                    message: "length limit exceeded".into(),
                },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "{err}");
        }
    }

    #[test]
    fn test_kind_follows_source_error() {
        assert_eq!(
            ApiError::from(ExecutionError::Timeout { budget_secs: 5 }).kind(),
            "Timeout"
        );
        assert_eq!(
            ApiError::from(StoreError::InvalidSchedule {
                interval: "x".into(),
                reason: "y".into()
            })
            .kind(),
            "InvalidSchedule"
        );
        assert_eq!(ApiError::InvalidInput("x".into()).kind(), "InputError");
    }
}
