//! Credit engine error types

use repurpose_shared::SharedError;
use thiserror::Error;

/// Postgres SQLSTATE codes the engine reacts to
mod sqlstate {
    pub const LOCK_NOT_AVAILABLE: &str = "55P03";
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
    pub const CHECK_VIOLATION: &str = "23514";
    pub const FOREIGN_KEY_VIOLATION: &str = "23503";
}

/// Engine errors.
///
/// Business rejections (insufficient credits, invalid code, ...) are not errors;
/// they are reported through outcome enums.
#[derive(Debug, Error)]
pub enum CreditError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lock wait timed out: {0}")]
    LockTimeout(String),

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),

    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CreditError {
    /// Conflicts the caller may surface as "try again"
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CreditError::LockTimeout(_) | CreditError::ConcurrentModification(_)
        )
    }

    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            CreditError::InvalidInput(_) => "INVALID_INPUT",
            CreditError::NotFound(_) => "NOT_FOUND",
            CreditError::LockTimeout(_) => "LOCK_TIMEOUT",
            CreditError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            CreditError::IntegrityViolation(_) => "INTEGRITY_VIOLATION",
            CreditError::Config(_) => "CONFIG_ERROR",
            CreditError::Database(_) => "DATABASE_ERROR",
            CreditError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn from_sqlstate(code: &str, message: String) -> Self {
        match code {
            sqlstate::LOCK_NOT_AVAILABLE => CreditError::LockTimeout(message),
            sqlstate::SERIALIZATION_FAILURE | sqlstate::DEADLOCK_DETECTED => {
                CreditError::ConcurrentModification(message)
            }
            sqlstate::CHECK_VIOLATION | sqlstate::FOREIGN_KEY_VIOLATION => {
                CreditError::IntegrityViolation(message)
            }
            _ => CreditError::Database(message),
        }
    }
}

impl From<sqlx::Error> for CreditError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if let Some(code) = db_err.code() {
                return CreditError::from_sqlstate(&code, db_err.message().to_string());
            }
        }
        CreditError::Database(err.to_string())
    }
}

impl From<SharedError> for CreditError {
    fn from(err: SharedError) -> Self {
        match err {
            SharedError::NotFound(msg) => CreditError::NotFound(msg),
            SharedError::Validation(msg) => CreditError::InvalidInput(msg),
            SharedError::DateOutOfRange(msg) => CreditError::Internal(msg),
            SharedError::Internal(msg) => CreditError::Internal(msg),
        }
    }
}

pub type CreditResult<T> = Result<T, CreditError>;
