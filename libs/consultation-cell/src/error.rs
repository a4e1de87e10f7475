use thiserror::Error;

use shared_models::error::AppError;

#[derive(Error, Debug)]
pub enum ConsultationError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Session busy: {0}")]
    Busy(String),

    #[error("Completion backend error: {0}")]
    Backend(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<ConsultationError> for AppError {
    fn from(error: ConsultationError) -> Self {
        match error {
            ConsultationError::Validation(msg) => AppError::ValidationError(msg),
            ConsultationError::Conflict(msg) => AppError::Conflict(msg),
            ConsultationError::Busy(msg) => AppError::Busy(msg),
            ConsultationError::Backend(msg) => AppError::ExternalService(msg),
            ConsultationError::NotFound(msg) => AppError::NotFound(msg),
            ConsultationError::Store(msg) => AppError::Internal(msg),
            ConsultationError::Database(msg) => AppError::Database(msg),
            ConsultationError::Serialization(e) => AppError::Internal(e.to_string()),
        }
    }
}
