//! Shared storage layer.
//!
//! Owns the SQLite connection and the locking around it. Domain crates
//! (the session store) define their own tables on top and reach the
//! connection through closures.

mod errors;
mod sqlite;

pub use errors::StorageError;
pub use sqlite::{SqliteDb, StorageConfig};

// Re-export rusqlite types that domain crates will need
pub use rusqlite::{
    Connection, Error as RusqliteError, OptionalExtension, Row, ToSql, Transaction,
    TransactionBehavior, params,
    types::ToSqlOutput,
};

/// Trait for storage backends.
pub trait StorageBackend {
    /// Apply connection-level settings.
    fn init(&self) -> Result<(), StorageError>;

    /// Execute a batch of SQL statements (for schema migrations).
    fn execute_batch(&self, sql: &str) -> Result<(), StorageError>;
}
