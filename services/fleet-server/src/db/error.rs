//! Store error types.

use thiserror::Error;

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the backing store.
    #[error("failed to connect to store: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// The store URL scheme is not supported.
    #[error("unsupported store url: {0}")]
    UnsupportedUrl(String),

    /// An operation addressed a key holding another kind of value.
    #[error("wrong type for key '{key}': expected {expected}, found {actual}")]
    WrongType {
        key: String,
        expected: &'static str,
        actual: String,
    },

    /// A guarded write found the hash field changed since it was read.
    #[error("conflicting write at '{key}' field '{field}'")]
    Conflict { key: String, field: String },

    /// A stored record could not be interpreted.
    #[error("corrupt record at '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<fleet_events::EventError> for StoreError {
    fn from(err: fleet_events::EventError) -> Self {
        StoreError::Corrupt {
            key: "<payload>".to_string(),
            reason: err.to_string(),
        }
    }
}
