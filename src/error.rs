//! Custom error types for the index sender.

use thiserror::Error;

/// Custom error type for index sender operations.
#[derive(Error, Debug)]
pub enum IndexSenderError {
    /// A required input was empty or absent.
    #[error("Null input: {0}")]
    NullInput(&'static str),

    /// Caller input does not match the data source layout.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Metadata, partition or sender configuration problem.
    #[error("Config error: {0}")]
    Configuration(String),

    /// Delivery failure reported by a transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// NATS client error.
    #[error("NATS client error: {0}")]
    Nats(#[from] async_nats::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server URL could not be parsed.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// I/O error, e.g. while spawning the flush thread or the runtime.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The sender was used after `close`.
    #[error("sender is closed")]
    Closed,
}

impl IndexSenderError {
    /// `true` for errors caused by malformed caller input.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::NullInput(_) | Self::Validation(_))
    }

    /// `true` for errors raised while delivering a batch.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Nats(_))
    }
}

/// A specialized `Result` type for index sender operations.
pub type Result<T> = std::result::Result<T, IndexSenderError>;
