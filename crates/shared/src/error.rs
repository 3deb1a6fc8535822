//! Error types shared across Repurpose crates

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SharedError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Date arithmetic out of range: {0}")]
    DateOutOfRange(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type SharedResult<T> = Result<T, SharedError>;
