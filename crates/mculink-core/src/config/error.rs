//! Error types for device configuration loading

use thiserror::Error;

/// Errors that can occur while loading a device configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading '{path}': {message}")]
    IoError { path: String, message: String },

    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Parse error at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Missing required section: [{0}]")]
    MissingSection(String),

    #[error("Missing required key '{key}' in section [{section}]")]
    MissingKey { section: String, key: String },

    #[error("Invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error("No configuration registered for device type '{0}'")]
    UnknownDevice(String),
}
