use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DqpError {
    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt record in {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("invariant violated: {0}")]
    StateError(String),
}
