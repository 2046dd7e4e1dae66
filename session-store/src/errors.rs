use double_ratchets::{PickleError, RatchetError};
use storage::{RusqliteError, StorageError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("pickle error: {0}")]
    Pickle(#[from] PickleError),

    #[error("ratchet error: {0}")]
    Ratchet(#[from] RatchetError),

    #[error("failed to encode ratchet safety: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt row in {table}: {reason}")]
    Corrupt {
        table: &'static str,
        reason: String,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("lock poisoned")]
    LockPoisoned,
}

impl From<StorageError> for StoreError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::LockPoisoned => StoreError::LockPoisoned,
            other => StoreError::Storage(other),
        }
    }
}

impl From<RusqliteError> for StoreError {
    fn from(e: RusqliteError) -> Self {
        StoreError::Storage(e.into())
    }
}

impl StoreError {
    pub(crate) fn corrupt(table: &'static str, reason: impl Into<String>) -> Self {
        StoreError::Corrupt {
            table,
            reason: reason.into(),
        }
    }
}
