//! # Error Types
//!
//! Custom error types for pwmon using `thiserror`.

use thiserror::Error;

use crate::flash::FlashError;

/// Main error type for pwmon
#[derive(Debug, Error)]
pub enum PwmonError {
    /// Wire protocol errors (malformed or foreign packets)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Flash driver errors
    #[error("Flash error: {0}")]
    Flash(#[from] FlashError),

    /// Broken storage contract: the log can no longer be reasoned about
    #[error("Storage invariant violated: {0}")]
    Invariant(String),

    /// Serial port errors
    #[error("Serial error: {0}")]
    Serial(String),

    /// None of the candidate serial devices could be opened
    #[error("No radio modem found (tried: {0})")]
    SerialPortNotFound(String),

    /// The simulated air lost its peer
    #[error("Radio link closed")]
    LinkClosed,

    /// Telemetry serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for pwmon
pub type Result<T> = std::result::Result<T, PwmonError>;
