//! Hostbook Error Types

use thiserror::Error;

use crate::network::protocol::DecodeError;
use crate::registry::Rejection;

/// Result type alias for Hostbook operations
pub type Result<T> = std::result::Result<T, Error>;

/// Hostbook error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    // Wire errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Decode(#[from] DecodeError),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // Registry errors
    #[error("Request rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("No master available")]
    NoMaster,

    #[error("Not master: current master is {0}")]
    NotMaster(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is transient and the operation may be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ConnectionTimeout(_)
            | Error::ConnectionFailed { .. }
            | Error::Network(_)
            | Error::NoMaster => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::NoMaster.is_retryable());
        assert!(Error::ConnectionTimeout("10.0.0.1:5007".into()).is_retryable());
        assert!(Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset)).is_retryable());
        assert!(!Error::Config("bad".into()).is_retryable());
        assert!(!Error::Rejected(Rejection::UnknownHost("srv9".into())).is_retryable());
    }
}
