//! Common error types for llmq
//!
//! This module defines all error types used across the scheduler.
//! Errors that end a job map onto one of the job-facing [`ErrorKind`]s.

use llmq_proto::{ErrorKind, JobId, JobStatus};
use std::time::Duration;
use thiserror::Error;

/// Main error type for llmq
#[derive(Error, Debug)]
pub enum LlmqError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or oversized request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested model does not fit in accelerator memory
    #[error("Capacity error: model {model} needs {required} bytes, {available} available")]
    Capacity {
        model: String,
        required: u64,
        available: u64,
    },

    /// Model switch failed after bounded retries
    #[error("Switch error for model {model}: {message}")]
    Switch { model: String, message: String },

    /// No token arrived within the inactivity window
    #[error("Stream timed out after {0:?} without a token")]
    StreamTimeout(Duration),

    /// Inference backend errors
    #[error("Backend error: {0}")]
    Backend(String),

    /// Backend answered with an HTTP error status
    #[error("Backend error: HTTP {status}: {message}")]
    BackendStatus { status: u16, message: String },

    /// Unknown job id
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// The claim token no longer owns the job (lease expired and redelivered)
    #[error("Stale claim on job {0}")]
    StaleClaim(JobId),

    /// Job already reached a different terminal state
    #[error("Job {job_id} already finalized as {status}")]
    AlreadyFinalized { job_id: JobId, status: JobStatus },

    /// Illegal state machine transition
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Scheduler is shutting down
    #[error("Scheduler shutting down")]
    ShuttingDown,

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for LlmqError {
    fn from(err: config::ConfigError) -> Self {
        LlmqError::Config(err.to_string())
    }
}

impl LlmqError {
    /// Job-facing error kind, if this error ends a job
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            LlmqError::Validation(_) => Some(ErrorKind::Validation),
            LlmqError::Capacity { .. } => Some(ErrorKind::Capacity),
            LlmqError::Switch { .. } => Some(ErrorKind::Switch),
            LlmqError::StreamTimeout(_) => Some(ErrorKind::StreamTimeout),
            LlmqError::Backend(_) | LlmqError::BackendStatus { .. } => Some(ErrorKind::Backend),
            _ => None,
        }
    }

    /// Whether the transport layer may retry the failed call
    ///
    /// Client errors (4xx) are final; retrying an unknown model or a bad
    /// request cannot succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmqError::Backend(_) | LlmqError::Io(_) => true,
            LlmqError::BackendStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        LlmqError::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        LlmqError::Validation(msg.into())
    }

    /// Create a backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        LlmqError::Backend(msg.into())
    }

    /// Create an error for an HTTP error status
    pub fn backend_status(status: u16, msg: impl Into<String>) -> Self {
        LlmqError::BackendStatus {
            status,
            message: msg.into(),
        }
    }

    /// Create a switch error
    pub fn switch(model: impl Into<String>, msg: impl Into<String>) -> Self {
        LlmqError::Switch {
            model: model.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        LlmqError::Internal(msg.into())
    }
}

/// Result type alias for llmq operations
pub type Result<T> = std::result::Result<T, LlmqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            LlmqError::validation("empty").kind(),
            Some(ErrorKind::Validation)
        );
        assert_eq!(
            LlmqError::switch("llama3", "load failed").kind(),
            Some(ErrorKind::Switch)
        );
        assert_eq!(
            LlmqError::StreamTimeout(Duration::from_secs(120)).kind(),
            Some(ErrorKind::StreamTimeout)
        );
        assert_eq!(
            LlmqError::backend_status(404, "model not found").kind(),
            Some(ErrorKind::Backend)
        );
        assert_eq!(LlmqError::JobNotFound(JobId::nil()).kind(), None);
    }

    #[test]
    fn test_transient_errors() {
        assert!(LlmqError::backend("connection reset").is_transient());
        assert!(LlmqError::backend_status(502, "bad gateway").is_transient());
        assert!(LlmqError::backend_status(503, "loading").is_transient());
        assert!(!LlmqError::backend_status(404, "model not found").is_transient());
        assert!(!LlmqError::backend_status(400, "invalid options").is_transient());
        assert!(!LlmqError::validation("too large").is_transient());
        assert!(!LlmqError::Capacity {
            model: "big".to_string(),
            required: 10,
            available: 1,
        }
        .is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = LlmqError::Capacity {
            model: "llama3:70b".to_string(),
            required: 40,
            available: 24,
        };
        assert_eq!(
            err.to_string(),
            "Capacity error: model llama3:70b needs 40 bytes, 24 available"
        );
    }
}
