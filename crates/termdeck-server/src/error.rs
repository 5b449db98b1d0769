use std::path::PathBuf;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("daemon did not answer {operation} in time")]
    DaemonRequestTimeout { operation: &'static str },

    #[error("terminal not found: {0}")]
    SessionNotFound(String),

    #[error("deck not found: {0}")]
    DeckNotFound(String),

    #[error("failed to spawn terminal: {0}")]
    SpawnFailure(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("terminal store {} is corrupted: {reason}", path.display())]
    StoreCorrupted { path: PathBuf, reason: String },

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::DaemonUnavailable(_) => StatusCode::BAD_GATEWAY,
            ServerError::DaemonRequestTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ServerError::SessionNotFound(_) | ServerError::DeckNotFound(_) => StatusCode::NOT_FOUND,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::SpawnFailure(_)
            | ServerError::Store(_)
            | ServerError::StoreCorrupted { .. }
            | ServerError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
