use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::records::RecordError;
use crate::trigger::TriggerError;

/// Request-handling failures, rendered as `{"error": code, "message": text}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Record(RecordError::EmailTaken) => (StatusCode::BAD_REQUEST, "email_taken"),
            ApiError::Record(RecordError::UserNotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Record(RecordError::Invalid(_)) => {
                (StatusCode::BAD_REQUEST, "validation_error")
            }
            ApiError::Record(RecordError::Database(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "store_error")
            }
            ApiError::Trigger(TriggerError::InvalidRequest(_)) => {
                (StatusCode::BAD_REQUEST, "validation_error")
            }
            ApiError::Trigger(TriggerError::ImageNotFound(_)) => {
                (StatusCode::NOT_FOUND, "image_not_found")
            }
            ApiError::Trigger(TriggerError::RuntimeUnavailable(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "runtime_unavailable")
            }
            ApiError::Trigger(TriggerError::Rejected { .. }) => {
                (StatusCode::BAD_GATEWAY, "launch_rejected")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": code, "message": self.to_string() }))).into_response()
    }
}
