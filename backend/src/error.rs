use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use wheel_core::WheelError;

use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Wheel(#[from] WheelError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("the wheel is busy, please try again")]
    Busy,
    #[error("invalid admin password")]
    Unauthorized,
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Wheel(WheelError::Validation(message.into()))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Wheel(WheelError::Validation(_)) => StatusCode::BAD_REQUEST,
            AppError::Wheel(WheelError::NotFound(_) | WheelError::AwardNotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            AppError::Wheel(WheelError::AlreadyRedeemed(_)) => StatusCode::CONFLICT,
            AppError::Wheel(WheelError::NoPrizesAvailable) => StatusCode::BAD_REQUEST,
            AppError::Wheel(WheelError::Conflict(_)) | AppError::Busy => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Storage(err) => {
                tracing::error!(error = %err, "request failed on storage");
                "internal server error".to_string()
            }
            AppError::Wheel(WheelError::Conflict(_)) => AppError::Busy.to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
