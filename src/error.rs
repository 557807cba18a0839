use thiserror::Error;

/// Errors surfaced by model construction and training.
#[derive(Error, Debug)]
pub enum RmtppError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Not implemented: {0}")]
    NotImplemented(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Training data error: {0}")]
    Data(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RmtppError>;
