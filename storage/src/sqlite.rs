//! SQLite storage backend.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{StorageBackend, StorageError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for SQLite storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    /// In-memory database (isolated, for simple testing).
    #[default]
    InMemory,
    /// Shared in-memory database with a name. Connections opened with the
    /// same name see the same data.
    SharedInMemory { name: String },
    /// File-based SQLite database.
    File { path: PathBuf },
}

/// SQLite database wrapper.
///
/// Holds a single connection behind a mutex so the database can be shared
/// across threads. Callers reach it through [`SqliteDb::with_connection`]
/// and [`SqliteDb::with_transaction`]; the lock is held for the duration of
/// the closure.
pub struct SqliteDb {
    conn: Mutex<Connection>,
}

impl SqliteDb {
    /// Creates a new SQLite database with the given configuration.
    pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        let conn = match config {
            StorageConfig::InMemory => Connection::open_in_memory()?,
            StorageConfig::SharedInMemory { name } => {
                let uri = format!("file:{name}?mode=memory&cache=shared");
                Connection::open_with_flags(
                    &uri,
                    OpenFlags::SQLITE_OPEN_URI
                        | OpenFlags::SQLITE_OPEN_READ_WRITE
                        | OpenFlags::SQLITE_OPEN_CREATE,
                )?
            }
            StorageConfig::File { path } => Connection::open(path)?,
        };
        debug!(?config, "opened sqlite database");

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    /// Creates an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::new(&StorageConfig::InMemory)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Runs `f` with exclusive access to the connection.
    pub fn with_connection<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<StorageError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Runs `f` inside a transaction. The transaction commits when `f`
    /// returns `Ok` and rolls back otherwise.
    pub fn with_transaction<T, E, F>(&self, behavior: TransactionBehavior, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<StorageError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(behavior)
            .map_err(StorageError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(StorageError::from)?;
        Ok(value)
    }
}

impl StorageBackend for SqliteDb {
    fn init(&self) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(())
    }

    fn execute_batch(&self, sql: &str) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute_batch(sql)
            .map_err(|e| StorageError::Migration(e.to_string()))
    }
}
