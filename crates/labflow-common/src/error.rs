//! Error types shared across labflow crates

use thiserror::Error;

/// Result type alias for labflow operations
pub type Result<T> = std::result::Result<T, LabflowError>;

/// Errors that are not owned by a single pipeline stage
#[derive(Error, Debug)]
pub enum LabflowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid identifier '{0}': only ASCII letters, digits and '_' are allowed")]
    InvalidIdentifier(String),
}

impl LabflowError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
