//! Error types for backlog operations.

use hive_core::db::{DatabaseError, is_busy};

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Structured failures of claim-protocol and step operations.
///
/// Lock contention is reported as [`StoreError::Conflict`], never as a raw
/// database error, so callers see one shape for every race they can lose.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("No features available")]
    NotAvailable,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error(transparent)]
    Database(DatabaseError),
}

impl StoreError {
    /// Stable wire name of the error kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::NotAvailable => "not_available",
            Self::Forbidden(_) => "forbidden",
            Self::Invalid(_) => "invalid",
            Self::Database(_) => "database",
        }
    }

    pub(crate) fn busy() -> Self {
        Self::Conflict("store busy".to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if is_busy(&e) {
            Self::busy()
        } else {
            Self::Database(DatabaseError::from(e))
        }
    }
}

impl From<DatabaseError> for StoreError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::Busy(_) => Self::busy(),
            other => Self::Database(other),
        }
    }
}
