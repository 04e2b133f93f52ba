use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Messaging source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Pull did not return within {0:?}")]
    PullTimeout(Duration),

    #[error("Blob already exists: {0}")]
    BlobAlreadyExists(String),

    #[error("Append of {size} bytes exceeds the {limit} byte append limit")]
    AppendSizeExceeded { size: usize, limit: usize },

    #[error("Failed to write blob {path}: {reason}")]
    Write { path: String, reason: String },

    #[error("Checkpoint failed: {0}")]
    Checkpoint(String),

    #[error("Invoker call {call} failed: {reason}")]
    InvokerCallFailed { call: usize, reason: String },

    #[error("Function request failed: {0}")]
    FunctionRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PersistorError {
    pub fn write(path: impl Into<String>, reason: impl ToString) -> Self {
        PersistorError::Write {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same storage operation could succeed.
    pub fn is_transient_write(&self) -> bool {
        matches!(self, PersistorError::Write { .. })
    }
}
