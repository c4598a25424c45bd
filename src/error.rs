use crate::middleware::error_handling;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        error_handling::into_response(self)
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Distinguishes between retryable and permanent errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Retryable,
    Permanent,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    /// Bad or missing input (empty content, unknown emoji, malformed payload).
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    /// Actor is authenticated but not allowed to perform the operation.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Operation is not valid for the entity's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Persistence layer failure. The client may resend; the server never retries.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("unsupported event type: {0}")]
    UnsupportedEvent(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("internal server error")]
    Internal,
}

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        AppError::Storage(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::Storage(e.to_string())
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        if self.is_retryable() {
            ErrorKind::Retryable
        } else {
            ErrorKind::Permanent
        }
    }

    /// Errors a client may resend on. The server itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Storage(_) | AppError::RateLimited)
    }

    /// Returns HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Validation(_) | AppError::UnsupportedEvent(_) => 400,
            AppError::Unauthorized => 401,
            AppError::Permission(_) => 403,
            AppError::NotFound(_) => 404,
            AppError::InvalidState(_) => 409,
            AppError::RateLimited => 429,
            AppError::Storage(_) => 503,
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => 500,
        }
    }

    /// Stable machine-readable code carried in HTTP bodies and WebSocket error frames.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::UnsupportedEvent(_) => "UNSUPPORTED_EVENT",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::Permission(_) => "PERMISSION_DENIED",
            AppError::InvalidState(_) => "INVALID_STATE",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Storage(_) => "STORAGE_UNAVAILABLE",
            AppError::RateLimited => "RATE_LIMITED",
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// Message safe to show a client. Storage and internal faults never expose driver text.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Storage(_) => "storage temporarily unavailable, please retry".to_string(),
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => {
                AppError::Internal.to_string()
            }
            other => other.to_string(),
        }
    }
}
