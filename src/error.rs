use crate::middleware::error_handling;
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(AppError::status_code(self)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        error_handling::into_response(self)
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    /// Caller is not a participant of the chat, or presented no valid identity.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    /// Backing store (Redis or Postgres) unreachable or timed out.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("flush scheduling failed: {0}")]
    Scheduling(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("session closed")]
    Closed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::StoreUnavailable(e.to_string())
    }
}

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        AppError::StoreUnavailable(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::StoreUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Serialization(e.to_string())
    }
}

impl AppError {
    /// Whether the delayed-delivery service should try the callback again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::StoreUnavailable(_)
                | AppError::Scheduling(_)
                | AppError::Internal(_)
                | AppError::Serialization(_)
        )
    }

    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Validation(_) => 400,
            AppError::Unauthorized(_) => 401,
            AppError::NotFound(_) => 404,
            AppError::StoreUnavailable(_) | AppError::Scheduling(_) => 503,
            AppError::Closed => 410,
            AppError::Config(_)
            | AppError::StartServer(_)
            | AppError::Serialization(_)
            | AppError::Internal(_) => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            AppError::Scheduling(_) => "SCHEDULING_ERROR",
            AppError::Closed => "SESSION_CLOSED",
            AppError::Config(_) | AppError::StartServer(_) => "SERVER_ERROR",
            AppError::Serialization(_) | AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Text placed in an outbound error frame. Backend details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            AppError::Unauthorized(msg) | AppError::NotFound(msg) | AppError::Validation(msg) => {
                msg.clone()
            }
            AppError::Closed => "session closed".to_string(),
            AppError::Scheduling(_) => "message stored, delivery delayed".to_string(),
            _ => "temporary failure, try again".to_string(),
        }
    }
}
