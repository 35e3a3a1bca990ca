use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use signal_core::CoreError;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("Room not found or expired")]
    NotFound,
    #[error("Room already has an answer")]
    AlreadyAnswered,
    #[error("Too many requests, try again later")]
    RateLimited,
    #[error("No room codes available, try again later")]
    Capacity,
    #[error("Server error")]
    Store(#[from] StoreError),
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::AlreadyAnswered => ApiError::AlreadyAnswered,
            other => ApiError::InvalidInput(other.to_string()),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::AlreadyAnswered => StatusCode::CONFLICT,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Capacity => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Store(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Store(err) = &self {
            tracing::error!(error = %err, "store failure");
        }
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}
