use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Reason codes returned with validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationCode {
    WordCountTooLow,
    RecordingNotSelected,
    InvalidDuration,
    InvalidMimeType,
    InvalidFileName,
    FileTooLarge,
    EmptyFile,
    InvalidTeacherScore,
    CommentTooLong,
    SkillMismatch,
    InvalidLimit,
    InvalidRequest,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCode::WordCountTooLow => "WORD_COUNT_TOO_LOW",
            ValidationCode::RecordingNotSelected => "RECORDING_NOT_SELECTED",
            ValidationCode::InvalidDuration => "INVALID_DURATION",
            ValidationCode::InvalidMimeType => "INVALID_MIME_TYPE",
            ValidationCode::InvalidFileName => "INVALID_FILE_NAME",
            ValidationCode::FileTooLarge => "FILE_TOO_LARGE",
            ValidationCode::EmptyFile => "EMPTY_FILE",
            ValidationCode::InvalidTeacherScore => "INVALID_TEACHER_SCORE",
            ValidationCode::CommentTooLong => "COMMENT_TOO_LONG",
            ValidationCode::SkillMismatch => "SKILL_MISMATCH",
            ValidationCode::InvalidLimit => "INVALID_LIMIT",
            ValidationCode::InvalidRequest => "INVALID_REQUEST",
        }
    }
}

/// Persistence failures. `Conflict` is raised by conditional writes and unique guards.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("record not found: {0}")]
    Missing(String),

    #[error("database error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{message}")]
    Validation {
        code: ValidationCode,
        message: String,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Store(StoreError),
}

impl PipelineError {
    pub fn validation(code: ValidationCode, message: impl Into<String>) -> Self {
        PipelineError::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        PipelineError::Conflict(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        PipelineError::NotFound(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        PipelineError::Forbidden(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        PipelineError::Internal(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Validation { code, .. } => code.as_str(),
            PipelineError::Conflict(_) | PipelineError::Store(StoreError::Conflict(_)) => {
                "CONFLICT"
            }
            PipelineError::NotFound(_) | PipelineError::Store(StoreError::Missing(_)) => {
                "NOT_FOUND"
            }
            PipelineError::Forbidden(_) => "FORBIDDEN",
            PipelineError::Internal(_) | PipelineError::Store(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::Validation { .. } => StatusCode::BAD_REQUEST,
            PipelineError::Conflict(_) | PipelineError::Store(StoreError::Conflict(_)) => {
                StatusCode::CONFLICT
            }
            PipelineError::NotFound(_) | PipelineError::Store(StoreError::Missing(_)) => {
                StatusCode::NOT_FOUND
            }
            PipelineError::Forbidden(_) => StatusCode::FORBIDDEN,
            PipelineError::Internal(_) | PipelineError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => PipelineError::Conflict(msg),
            StoreError::Missing(msg) => PipelineError::NotFound(msg),
            other => PipelineError::Store(other),
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = json!({
            "error": self.code(),
            "message": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}
