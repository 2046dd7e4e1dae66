use thiserror::Error;

use crate::backend::BackendKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RatchetError {
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("message replay detected")]
    MessageReplay,

    #[error("too many skipped messages")]
    TooManySkippedMessages,

    #[error("missing receiving chain")]
    MissingReceivingChain,

    #[error("missing sending chain")]
    MissingSendingChain,

    #[error("missing remote DH key")]
    MissingRemoteDhKey,

    #[error("deserialization failed")]
    DeserializationFailed,

    #[error("malformed message")]
    MalformedMessage,

    #[error("invalid key material")]
    InvalidKey,

    #[error("bad message signature")]
    BadSignature,

    #[error("pre-key message does not belong to this session")]
    SessionMismatch,

    #[error("one-time key not found")]
    UnknownOneTimeKey,

    #[error("unknown message index {requested}, first known is {first_known}")]
    UnknownMessageIndex { first_known: u32, requested: u32 },

    #[error("{0} primitive failed")]
    Primitive(&'static str),

    #[error("{active} backend already installed, cannot switch to {requested}")]
    BackendMismatch {
        active: BackendKind,
        requested: BackendKind,
    },
}

impl From<proto::WireError> for RatchetError {
    fn from(_: proto::WireError) -> Self {
        RatchetError::MalformedMessage
    }
}

impl From<crypto::KeyError> for RatchetError {
    fn from(_: crypto::KeyError) -> Self {
        RatchetError::InvalidKey
    }
}

/// Failures opening or sealing a pickled object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PickleError {
    #[error("no pickle key provided")]
    NoKeyProvided,

    #[error("pickle key does not match")]
    BadPassphrase,

    #[error("pickle data is corrupt")]
    CorruptData,

    #[error("backend failed while sealing pickle")]
    Backend,
}
