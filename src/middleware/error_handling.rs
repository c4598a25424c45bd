use crate::error::AppError;
use actix_web::{http::StatusCode, HttpResponse};
use serde::{Deserialize, Serialize};

/// Unified HTTP error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
    pub code: String,
    pub timestamp: String,
}

/// Error frame pushed to the originating WebSocket session only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorFrame {
    pub error: String,
    pub code: String,
}

pub fn map_error(err: &AppError) -> (StatusCode, ErrorResponse) {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    if status.is_server_error() {
        tracing::error!(error = %err, code = err.error_code(), "request failed");
    }

    let response = ErrorResponse {
        error: status
            .canonical_reason()
            .unwrap_or("Error")
            .to_string(),
        message: err.public_message(),
        status: status.as_u16(),
        code: err.error_code().to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    (status, response)
}

pub fn into_response(err: &AppError) -> HttpResponse {
    let (status, body) = map_error(err);
    HttpResponse::build(status).json(body)
}

pub fn error_frame(err: &AppError) -> ErrorFrame {
    ErrorFrame {
        error: err.public_message(),
        code: err.error_code().to_string(),
    }
}

/// Serialized error frame; falls back to a static body if serialization ever fails.
pub fn error_frame_json(err: &AppError) -> String {
    serde_json::to_string(&error_frame(err))
        .unwrap_or_else(|_| r#"{"error":"internal server error","code":"INTERNAL_ERROR"}"#.into())
}
