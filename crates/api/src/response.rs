use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use omniq_core::errors::OmniqError;

#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Error body with the status the error class maps to.
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<OmniqError> for ApiError {
    fn from(err: OmniqError) -> Self {
        let status = match &err {
            OmniqError::TaskNotFound { .. } => StatusCode::NOT_FOUND,
            OmniqError::Validation(_) => StatusCode::BAD_REQUEST,
            OmniqError::QuotaExceeded(_) | OmniqError::ResourceExhausted(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            OmniqError::MessageQueue(_) | OmniqError::Timeout(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            message: Some(self.message),
            timestamp: chrono::Utc::now(),
        };
        (self.status, Json(body)).into_response()
    }
}
