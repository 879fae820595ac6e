//! Link errors

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur while talking to a device
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("Cannot open {port}: {reason}")]
    ConnectionFailed { port: String, reason: String },

    #[error("Identity mismatch: expected '{expected}', got '{actual}'")]
    IdentityMismatch { expected: String, actual: String },

    #[error("Response is not valid text: {0}")]
    Decode(String),

    #[error("Not connected to device")]
    NotConnected,

    #[error("Line exceeds {0} bytes without a delimiter")]
    LineTooLong(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
