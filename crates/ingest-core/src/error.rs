//! Error types for the ingest server
//!
//! Uses `thiserror` for ergonomic error handling with source preservation.

use thiserror::Error;

/// Result type alias for ingest operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Primary error type for all ingest operations
#[derive(Error, Debug)]
pub enum IngestError {
    /// Configuration errors (missing or malformed options)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Object store upload errors
    #[error("Upload error: {message}")]
    Upload {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Batch serialization/compression errors
    #[error("Encode error: {message}")]
    Encode {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Local failure-queue storage errors
    #[error("Failure queue error: {message}")]
    Queue {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation timeout
    #[error("Timeout: {operation} exceeded {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Shutdown cancellation; not a failure in steady state
    #[error("Operation cancelled")]
    Cancelled,
}

impl IngestError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an upload error
    pub fn upload(message: impl Into<String>) -> Self {
        Self::Upload {
            message: message.into(),
            source: None,
        }
    }

    /// Create an upload error with source
    pub fn upload_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Upload {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an encode error with source
    pub fn encode_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Encode {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a failure-queue error with source
    pub fn queue_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Queue {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    /// Check if this error is a shutdown cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
