//! Deprecated encodings, used only at import and export boundaries.
//!
//! * The unsigned session export: `0x01 ‖ index (u32 BE) ‖ ratchet (128) ‖
//!   signing key (32)`, usually carried as unpadded base64.
//! * The quoted pickle: a pickle rendered as a JSON string of its unpadded
//!   base64 form.

use base64::{Engine, engine::general_purpose::STANDARD_NO_PAD};
use crypto::Ed25519PublicKey;
use double_ratchets::{ExportedRatchet, Pickle, RATCHET_LEN, RatchetBackend};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::errors::EngineError;

const EXPORT_VERSION: u8 = 0x01;
pub const EXPORT_LEN: usize = 1 + 4 + RATCHET_LEN + 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompatError {
    #[error("session export must be {EXPORT_LEN} bytes, got {0}")]
    BadLength(usize),

    #[error("unsupported session export version {0:#04x}")]
    BadVersion(u8),

    #[error("invalid base64")]
    Base64,

    #[error("legacy pickle is not a JSON string")]
    NotJsonString,
}

pub fn encode_export(exported: &ExportedRatchet) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(EXPORT_LEN));
    out.push(EXPORT_VERSION);
    out.extend_from_slice(&exported.index.to_be_bytes());
    out.extend_from_slice(&exported.ratchet);
    out.extend_from_slice(exported.signing_key.as_bytes());
    out
}

pub fn decode_export(bytes: &[u8]) -> Result<ExportedRatchet, CompatError> {
    if bytes.len() != EXPORT_LEN {
        return Err(CompatError::BadLength(bytes.len()));
    }
    if bytes[0] != EXPORT_VERSION {
        return Err(CompatError::BadVersion(bytes[0]));
    }
    let mut index = [0u8; 4];
    index.copy_from_slice(&bytes[1..5]);
    let mut ratchet = [0u8; RATCHET_LEN];
    ratchet.copy_from_slice(&bytes[5..5 + RATCHET_LEN]);
    let mut signing_key = [0u8; 32];
    signing_key.copy_from_slice(&bytes[5 + RATCHET_LEN..]);

    Ok(ExportedRatchet {
        index: u32::from_be_bytes(index),
        ratchet,
        signing_key: Ed25519PublicKey::from(signing_key),
    })
}

pub fn export_to_base64(exported: &ExportedRatchet) -> String {
    STANDARD_NO_PAD.encode(&encode_export(exported)[..])
}

pub fn export_from_base64(encoded: &str) -> Result<ExportedRatchet, CompatError> {
    let bytes = Zeroizing::new(
        STANDARD_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|_| CompatError::Base64)?,
    );
    decode_export(&bytes)
}

/// Pickle `value` and wrap it as a JSON string literal.
pub fn pickle_to_json<P, B>(backend: &B, value: &P, key: &[u8]) -> Result<String, EngineError>
where
    P: Pickle,
    B: RatchetBackend + ?Sized,
{
    let sealed = value.pickle(backend, key)?;
    Ok(format!("\"{}\"", STANDARD_NO_PAD.encode(sealed)))
}

pub fn pickle_from_json<P, B>(backend: &B, json: &str, key: &[u8]) -> Result<P, EngineError>
where
    P: Pickle,
    B: RatchetBackend + ?Sized,
{
    let inner = json
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .ok_or(CompatError::NotJsonString)?;
    let sealed = STANDARD_NO_PAD
        .decode(inner)
        .map_err(|_| CompatError::Base64)?;
    Ok(P::unpickle(backend, &sealed, key)?)
}
