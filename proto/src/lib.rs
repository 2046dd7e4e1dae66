//! Wire messages exchanged between devices.
//!
//! Every ciphertext on the wire is a single version byte followed by the
//! protobuf encoding of one of the messages below. Group messages
//! additionally carry a trailing 64-byte signature, which is handled by the
//! group session rather than here.

pub use prost::{DecodeError, Message};

/// Version byte prefixed to every encoded message.
pub const WIRE_VERSION: u8 = 0x03;

/// A normal pairwise ratchet message.
#[derive(Clone, PartialEq, Message)]
pub struct PairwiseMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub ratchet_key: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub counter: u32,
    #[prost(uint32, tag = "3")]
    pub previous_counter: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub ciphertext: Vec<u8>,
}

/// The first message(s) of a pairwise session, carrying the handshake keys
/// alongside an encoded `PairwiseMessage`.
#[derive(Clone, PartialEq, Message)]
pub struct PreKeyMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub one_time_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub base_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub identity_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub message: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GroupMessage {
    #[prost(uint32, tag = "1")]
    pub message_index: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("empty message")]
    Empty,
    #[error("unsupported wire version {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("malformed message: {0}")]
    Decode(#[from] DecodeError),
}

/// Encode `msg` with the version prefix.
pub fn encode_versioned<M: Message>(msg: &M) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + msg.encoded_len());
    out.push(WIRE_VERSION);
    msg.encode_raw(&mut out);
    out
}

/// Strip and check the version prefix, then decode the remainder.
pub fn decode_versioned<M: Message + Default>(bytes: &[u8]) -> Result<M, WireError> {
    let (&version, body) = bytes.split_first().ok_or(WireError::Empty)?;
    if version != WIRE_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    Ok(M::decode(body)?)
}
