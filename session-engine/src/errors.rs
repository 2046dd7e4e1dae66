use std::path::PathBuf;

use double_ratchets::{PickleError, RatchetError};
use session_store::{StoreError, WithheldCode};
use thiserror::Error;

use crate::compat::CompatError;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The message cannot be decrypted or produced. Retrying will not help.
    Cryptographic,
    /// Key material is missing. A key request may resolve it.
    Pending,
    /// The message, or its ratchet index, was seen before.
    Replay,
    /// The persistence layer failed.
    Store,
    /// Sealed or legacy data could not be opened.
    Format,
    /// The engine was configured inconsistently.
    Config,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no session with {sender_key} could decrypt the message")]
    NoSessionFound { sender_key: String },

    #[error("no group session {session_id} in {room_id}")]
    NoGroupSession { room_id: String, session_id: String },

    #[error(
        "group session {session_id} starts at index {first_known}, message is at {requested}"
    )]
    UnknownMessageIndex {
        session_id: String,
        first_known: u32,
        requested: u32,
    },

    #[error("group session {session_id} was withheld: {code} ({reason})")]
    GroupSessionWithheld {
        session_id: String,
        code: WithheldCode,
        reason: String,
    },

    #[error("index {index} of group session {session_id} was already used by another event")]
    DuplicateMessageIndex { session_id: String, index: u32 },

    #[error("pairwise message was already decrypted")]
    DuplicateMessage,

    #[error("no outbound group session for {0}")]
    NoOutboundGroupSession(String),

    #[error("outbound group session for {0} has expired and must be rotated")]
    OutboundSessionExpired(String),

    #[error("message claims sender {actual} but the session belongs to {expected}")]
    SenderKeyMismatch { expected: String, actual: String },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("ratchet error: {0}")]
    Ratchet(#[from] RatchetError),

    #[error("pickle error: {0}")]
    Pickle(PickleError),

    #[error("legacy format error: {0}")]
    Compat(#[from] CompatError),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("lock poisoned")]
    LockPoisoned,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NoSessionFound { .. }
            | EngineError::NoGroupSession { .. }
            | EngineError::UnknownMessageIndex { .. }
            | EngineError::GroupSessionWithheld { .. } => ErrorKind::Pending,
            EngineError::DuplicateMessageIndex { .. } | EngineError::DuplicateMessage => {
                ErrorKind::Replay
            }
            EngineError::Pickle(_) | EngineError::Compat(_) => ErrorKind::Format,
            EngineError::Store(_) | EngineError::LockPoisoned => ErrorKind::Store,
            EngineError::Config(_) | EngineError::Ratchet(RatchetError::BackendMismatch { .. }) => {
                ErrorKind::Config
            }
            EngineError::NoOutboundGroupSession(_)
            | EngineError::OutboundSessionExpired(_)
            | EngineError::SenderKeyMismatch { .. }
            | EngineError::MalformedPayload(_)
            | EngineError::Ratchet(_) => ErrorKind::Cryptographic,
        }
    }

    /// Stable identifier for logs and for callers across an FFI or IPC
    /// boundary.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NoSessionFound { .. } => "no_session_found",
            EngineError::NoGroupSession { .. } => "no_group_session",
            EngineError::UnknownMessageIndex { .. } => "unknown_message_index",
            EngineError::GroupSessionWithheld { .. } => "group_session_withheld",
            EngineError::DuplicateMessageIndex { .. } => "duplicate_message_index",
            EngineError::DuplicateMessage => "duplicate_message",
            EngineError::NoOutboundGroupSession(_) => "no_outbound_group_session",
            EngineError::OutboundSessionExpired(_) => "outbound_session_expired",
            EngineError::SenderKeyMismatch { .. } => "sender_key_mismatch",
            EngineError::MalformedPayload(_) => "malformed_payload",
            EngineError::Ratchet(RatchetError::BackendMismatch { .. }) => "backend_mismatch",
            EngineError::Ratchet(_) => "ratchet_failure",
            EngineError::Pickle(PickleError::NoKeyProvided) => "no_key_provided",
            EngineError::Pickle(PickleError::BadPassphrase) => "bad_passphrase",
            EngineError::Pickle(PickleError::CorruptData) => "corrupt_data",
            EngineError::Pickle(PickleError::Backend) => "pickle_backend_failure",
            EngineError::Compat(_) => "legacy_format",
            EngineError::Store(_) => "store_failure",
            EngineError::Config(_) => "invalid_config",
            EngineError::LockPoisoned => "lock_poisoned",
        }
    }

    /// Whether the failure may resolve once more key material arrives.
    pub fn is_pending(&self) -> bool {
        self.kind() == ErrorKind::Pending
    }
}

impl From<PickleError> for EngineError {
    fn from(e: PickleError) -> Self {
        EngineError::Pickle(e)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::MalformedPayload(e.to_string())
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Pickle(e) => EngineError::Pickle(e),
            other => EngineError::Store(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(&'static str),
}
