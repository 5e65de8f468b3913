//! Error types for segdl core

use thiserror::Error;

/// Errors that can occur in segdl core
#[derive(Debug, Error)]
pub enum SegdlError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Segment transport error at offset {offset}: {message}")]
    SegmentTransport { offset: u64, message: String },

    #[error("Write error at offset {offset}: {source}")]
    Write {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Listener error: {0}")]
    Listener(String),

    #[error("Server did not honor range request (status {status})")]
    RangeNotHonored { status: u16 },

    #[error("Range mismatch: expected {expected} bytes, received {received}")]
    RangeMismatch { expected: u64, received: u64 },

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("Transfer aborted: {0}")]
    Fatal(String),

    #[error("Transfer was cancelled")]
    Cancelled,
}

impl SegdlError {
    /// Check if a segment may be retried after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            SegdlError::Network(_) | SegdlError::SegmentTransport { .. } => true,
            SegdlError::ServerError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Wrap a listener failure
    pub fn listener(error: anyhow::Error) -> Self {
        SegdlError::Listener(format!("{:#}", error))
    }
}
