//! Common error types for the failover components.

use std::fmt;

/// A specialized Result type for failover operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for failover operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Address error: {0}")]
    Address(String),

    #[error("Address conflict: {0}")]
    Conflict(String),

    #[error("Operation rejected: {0}")]
    Rejected(String),

    #[error("Engine stopped: {0}")]
    Stopped(String),

    #[error("Re-entrant call on engine thread: {0}")]
    Reentrant(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new wire protocol error.
    pub fn protocol(msg: impl fmt::Display) -> Self {
        Error::Protocol(msg.to_string())
    }

    /// Create a new address assignment error.
    pub fn address(msg: impl fmt::Display) -> Self {
        Error::Address(msg.to_string())
    }

    /// Create a new address conflict error.
    pub fn conflict(msg: impl fmt::Display) -> Self {
        Error::Conflict(msg.to_string())
    }

    /// Create a new rejected-operation error.
    pub fn rejected(msg: impl fmt::Display) -> Self {
        Error::Rejected(msg.to_string())
    }

    /// Create a new stopped error.
    pub fn stopped(msg: impl fmt::Display) -> Self {
        Error::Stopped(msg.to_string())
    }

    /// Create a new other error.
    pub fn other(msg: impl fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }

    /// Whether this error is an operator precondition failure.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Error::Rejected(_))
    }
}
