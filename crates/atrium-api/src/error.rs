use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use atrium_store::StoreError;

/// REST-facing failure type. Every non-2xx response renders as
/// `{"success": false, "message": ...}` so clients have one error shape.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Authentication required")]
    AuthFailed,
}

impl ApiError {
    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError::Store(StoreError::Internal(msg.into()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::AuthFailed => StatusCode::UNAUTHORIZED,
            ApiError::Store(e) => match e {
                StoreError::NotFound(_) => StatusCode::NOT_FOUND,
                StoreError::PermissionDenied(_) => StatusCode::FORBIDDEN,
                StoreError::InvalidState(_) => StatusCode::CONFLICT,
                StoreError::Expired(_) | StoreError::Validation(_) => StatusCode::BAD_REQUEST,
                StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                StoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };

        if status.is_server_error() {
            error!("request failed: {}", self);
        }

        // Internal details stay in the log, not the response body.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(json!({ "success": false, "message": message }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
