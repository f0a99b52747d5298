// Price storage: the store contract plus SQLite and in-memory backends

pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::types::CanonicalRecord;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("schema unavailable: {0}")]
    Schema(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Schema(_) => "schema",
            StoreError::Constraint(_) => "constraint",
            StoreError::Unavailable(_) => "unavailable",
            StoreError::InvalidValue(_) => "invalid_value",
            StoreError::Timeout(_) => "timeout",
            StoreError::Backend(_) => "backend",
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        let message = err.to_string();
        match &err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                ErrorCode::ConstraintViolation => StoreError::Constraint(message),
                ErrorCode::TypeMismatch | ErrorCode::TooBig => StoreError::InvalidValue(message),
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::ReadOnly
                | ErrorCode::DiskFull => StoreError::Unavailable(message),
                _ => StoreError::Backend(message),
            },
            rusqlite::Error::ToSqlConversionFailure(_)
            | rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..) => StoreError::InvalidValue(message),
            _ => StoreError::Backend(message),
        }
    }
}

/// Transactional destination for canonical price rows, keyed on the identity key.
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Create the destination table if absent. Never drops or alters existing data.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Insert-or-overwrite every record in one atomic operation.
    ///
    /// Returns the number of rows inserted or updated. On error nothing from
    /// this call is visible, and a call dropped before it returns (a caller
    /// timeout) must not commit either.
    async fn upsert_batch(&self, records: &[CanonicalRecord]) -> Result<usize, StoreError>;

    /// All stored rows ordered by identity key.
    async fn load_all(&self) -> Result<Vec<CanonicalRecord>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;
}

/// Table names are interpolated into SQL, so only plain identifiers are allowed.
pub fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
