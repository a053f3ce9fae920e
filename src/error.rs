use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
    pub status_code: i32,
}

/// Error surfaced to HTTP clients. Matching never rolls back on settlement
/// failure, so everything carried here is a synchronous admission-time error.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into() }
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    pub fn insufficient_escrow(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYMENT_REQUIRED, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = ErrorBody { detail: self.detail, status_code: 0 };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, value.to_string())
    }
}

impl From<crate::chain::ChainError> for ApiError {
    fn from(value: crate::chain::ChainError) -> Self {
        use crate::chain::ChainError;
        match value {
            ChainError::InsufficientEscrow { .. } => Self::insufficient_escrow(value.to_string()),
            ChainError::Config(_) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, value.to_string()),
            ChainError::Revert(_) | ChainError::Transient(_) => {
                Self::new(StatusCode::BAD_GATEWAY, value.to_string())
            }
        }
    }
}
