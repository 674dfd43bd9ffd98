//! Error types for the point-value store

use crate::engine::traits::Capability;
use thiserror::Error;

/// Main error type for the point-value store
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed query or write parameters, detected before the backend is contacted
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The backend declined an optional operation
    #[error("Unsupported capability: {0}")]
    UnsupportedCapability(Capability),

    /// Backend I/O or storage failure, propagated unchanged
    #[error("Storage error: {0}")]
    Storage(StorageError),

    /// Write queue error
    #[error("Ingestion error: {0}")]
    Ingestion(#[from] IngestionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for [`Error::InvalidArgument`]
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    /// True if this is an [`Error::InvalidArgument`]
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument(_))
    }

    /// True if this is an [`Error::UnsupportedCapability`]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::UnsupportedCapability(_))
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Unsupported(capability) => Error::UnsupportedCapability(capability),
            other => Error::Storage(other),
        }
    }
}

/// Storage errors raised by [`PointValueStore`](crate::engine::PointValueStore) implementations
#[derive(Error, Debug)]
pub enum StorageError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend does not implement an optional operation
    #[error("Operation not supported: {0}")]
    Unsupported(Capability),

    /// Storage backend is unavailable (connection lost, shut down, ...)
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Data is corrupted
    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    /// Any other backend failure
    #[error("{0}")]
    Backend(String),
}

/// Write queue errors
#[derive(Error, Debug)]
pub enum IngestionError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Queue was closed (writer pool shut down)
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Queue is at capacity and the overflow policy rejects new writes
    #[error("Backpressure: {0}")]
    Backpressure(String),

    /// Asynchronous writes were not enabled for this store
    #[error("Async writes disabled")]
    AsyncWritesDisabled,

    /// Shutdown error
    #[error("Shutdown error: {0}")]
    ShutdownError(String),
}

/// Validation errors
///
/// Raised by configuration validation.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Value is out of allowed range
    #[error("{field} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        /// Field name being validated
        field: String,
        /// The invalid value
        value: String,
        /// Minimum allowed value
        min: String,
        /// Maximum allowed value
        max: String,
    },

    /// Invalid format
    #[error("Invalid format for {field}: {message}")]
    InvalidFormat {
        /// Field name being validated
        field: String,
        /// Description of the format error
        message: String,
    },
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::Configuration(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
