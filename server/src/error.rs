//! Unified error handling for the server.
//!
//! Status codes follow what `custody_engine::remote::classify` expects:
//! `409` carries the stored record, `404` means the record is gone, other
//! `4xx` are rejections and `5xx` are retried by the client.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use custody_engine::Record;
use serde::Serialize;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("engine error: {0}")]
    Engine(#[from] custody_engine::Error),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("record not found: {table}/{id}")]
    NotFound { table: String, id: String },

    /// The stored version wins over the incoming write.
    #[error("stale write for {}/{}", current.table, current.id)]
    Conflict { current: Box<Record> },

    #[error("unauthorized")]
    Unauthorized,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current: Option<Record>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details, current) = match self {
            AppError::Database(e) => {
                tracing::error!(error = ?e, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                    None,
                    None,
                )
            }
            AppError::Engine(e) => match e {
                custody_engine::Error::TableNotFound(_)
                | custody_engine::Error::InvalidPayload(_)
                | custody_engine::Error::MissingRequiredField(_)
                | custody_engine::Error::TypeMismatch { .. } => {
                    tracing::warn!(error = %e, "invalid record");
                    (
                        StatusCode::UNPROCESSABLE_ENTITY,
                        "Invalid record".to_string(),
                        Some(e.to_string()),
                        None,
                    )
                }
                other => {
                    tracing::error!(error = %other, "engine error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error".to_string(),
                        None,
                        None,
                    )
                }
            },
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "Invalid request".to_string(),
                Some(msg),
                None,
            ),
            AppError::NotFound { table, id } => (
                StatusCode::NOT_FOUND,
                "Not found".to_string(),
                Some(format!("{table}/{id}")),
                None,
            ),
            AppError::Conflict { current } => (
                StatusCode::CONFLICT,
                "Stale write".to_string(),
                Some(format!(
                    "stored version of {}/{} is at {}",
                    current.table, current.id, current.updated_at
                )),
                Some(*current),
            ),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "Unauthorized".to_string(),
                None,
                None,
            ),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    None,
                    None,
                )
            }
        };

        let body = Json(ErrorResponse {
            error,
            details,
            current,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
