// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::vm::VmError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hsvm_kernel::KernelError;
use hsvm_persistence::PersistenceError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    Vm(#[from] VmError),
    #[error("Storage error: {0}")]
    Storage(#[from] PersistenceError),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, errcode, message) = match self {
            EngineError::Vm(e) => (
                StatusCode::from_u16(e.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                e.code.reflect(),
                e.to_string(),
            ),
            EngineError::Storage(e) => (StatusCode::INTERNAL_SERVER_ERROR, "M_UNKNOWN", e.to_string()),
            EngineError::Network(msg) => (StatusCode::BAD_GATEWAY, "M_UNKNOWN", msg),
            EngineError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "M_BAD_JSON", msg),
            EngineError::NotFound(msg) => (StatusCode::NOT_FOUND, "M_NOT_FOUND", msg),
            EngineError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "M_UNKNOWN",
                "Internal server error".to_string(),
            ),
        };

        let body = Json(json!({
            "errcode": errcode,
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<KernelError> for EngineError {
    fn from(e: KernelError) -> Self {
        EngineError::InvalidInput(e.to_string())
    }
}
