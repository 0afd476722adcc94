// src/error.rs

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use mongodb::error::{ErrorKind, RETRYABLE_WRITE_ERROR, TRANSIENT_TRANSACTION_ERROR};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

/// Stable wire codes carried by `delete_message_ack` and `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    Forbidden,
    AlreadyDeleted,
    NotFound,
    Unauthorized,
    Transport,
    Unavailable,
    Internal,
}

impl ErrorCode {
    /// "Try later" failures, as opposed to hard ones.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::Transport | ErrorCode::Unavailable)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("message was already deleted for everyone")]
    AlreadyDeleted,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ChatError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ChatError::Validation(_) => ErrorCode::Validation,
            ChatError::Forbidden(_) => ErrorCode::Forbidden,
            ChatError::AlreadyDeleted => ErrorCode::AlreadyDeleted,
            ChatError::NotFound(_) => ErrorCode::NotFound,
            ChatError::Unauthorized => ErrorCode::Unauthorized,
            ChatError::Transport(_) => ErrorCode::Transport,
            ChatError::Unavailable(_) => ErrorCode::Unavailable,
            ChatError::Storage(_) | ChatError::Config(_) => ErrorCode::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Text safe to hand back to a client. Storage details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ChatError::Storage(_) | ChatError::Config(_) => "Internal error".to_string(),
            ChatError::Unavailable(_) => "Chat is busy, try again later".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<mongodb::error::Error> for ChatError {
    fn from(e: mongodb::error::Error) -> Self {
        let transient = e.contains_label(RETRYABLE_WRITE_ERROR)
            || e.contains_label(TRANSIENT_TRANSACTION_ERROR)
            || matches!(
                *e.kind,
                ErrorKind::Io(_)
                    | ErrorKind::ServerSelection { .. }
                    | ErrorKind::ConnectionPoolCleared { .. }
            );
        if transient {
            ChatError::Unavailable(e.to_string())
        } else {
            ChatError::Storage(e.to_string())
        }
    }
}

impl ResponseError for ChatError {
    fn status_code(&self) -> StatusCode {
        match self {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
            ChatError::AlreadyDeleted => StatusCode::CONFLICT,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Unauthorized => StatusCode::UNAUTHORIZED,
            ChatError::Transport(_) | ChatError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::Storage(_) | ChatError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "success": false,
            "code": self.code(),
            "message": self.public_message(),
        }))
    }
}
