//! Dispatch error types.

use thiserror::Error;

use courier_core::DomainError;
use courier_queue::{BackendError, JobError};

/// Relational store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error in {operation}: {message}")]
    Database { operation: &'static str, message: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn database(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Database {
            operation,
            message: message.into(),
        }
    }
}

impl From<DomainError> for StoreError {
    fn from(e: DomainError) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

/// Messaging transport failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("message rejected: {0}")]
    Rejected(String),

    #[error("invalid transport response: {0}")]
    InvalidResponse(String),
}

/// Notification channel failure.
#[derive(Debug, Error)]
#[error("notify failed: {0}")]
pub struct NotifyError(pub String);

/// Anything a pipeline stage or control operation can fail with.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] BackendError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("no messaging connection available: {0}")]
    NoConnection(String),
}

/// Unexpected pipeline errors go back to the queue's attempt/backoff policy.
impl From<PipelineError> for JobError {
    fn from(e: PipelineError) -> Self {
        JobError::retry(e)
    }
}
