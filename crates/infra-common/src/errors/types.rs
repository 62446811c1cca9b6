use std::io;
use thiserror::Error;

/// Result type alias using the infrastructure error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the shared infrastructure
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A configuration key is present but its value cannot be read as the requested type
    #[error("Malformed value for '{key}': '{value}' (expected {expected})")]
    Malformed {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("Logging error: {0}")]
    Logging(String),
}

impl Error {
    pub(crate) fn malformed(key: &str, value: &str, expected: &'static str) -> Self {
        Error::Malformed {
            key: key.to_string(),
            value: value.to_string(),
            expected,
        }
    }
}
