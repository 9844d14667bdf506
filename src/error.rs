//! error.rs
//! Error taxonomy shared by every pipeline component.
//! - `BadRequest` surfaces to ingest callers; everything else is absorbed
//!   somewhere upstream of the caller and only ever observed via logs.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("durable store error: {0}")]
    DurableStoreError(String),

    #[error("subscriber gone")]
    SubscriberGone,

    #[error("cancelled")]
    Cancelled,

    #[error("programming error: {0}")]
    ProgrammingError(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl From<redis::RedisError> for PipelineError {
    fn from(e: redis::RedisError) -> Self {
        PipelineError::CacheUnavailable(e.to_string())
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::DurableStoreError(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::ProgrammingError(format!("json: {e}"))
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = match &self {
            PipelineError::BadRequest(_) => StatusCode::BAD_REQUEST,
            PipelineError::SubscriberGone => StatusCode::GONE,
            PipelineError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::CacheUnavailable(_)
            | PipelineError::DurableStoreError(_)
            | PipelineError::ProgrammingError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({"status": "error", "message": self.to_string()});
        (status, axum::Json(body)).into_response()
    }
}
