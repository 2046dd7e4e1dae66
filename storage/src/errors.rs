use thiserror::Error;

/// Common storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("migration error: {0}")]
    Migration(String),

    /// A thread panicked while holding the connection.
    #[error("connection lock poisoned")]
    LockPoisoned,
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}
