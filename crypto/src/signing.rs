//! Ed25519 key and signature containers.
//!
//! The signing arithmetic itself belongs to the ratchet backend. These types
//! only carry the bytes and their transport encoding so that every crate
//! agrees on one representation.

use std::fmt::{self, Debug, Display};

use base64::{Engine, engine::general_purpose::STANDARD_NO_PAD};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::keys::{KeyError, decode_fixed};

/// A 32-byte Ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ed25519PublicKey([u8; 32]);

impl Ed25519PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD_NO_PAD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        decode_fixed::<32>(encoded).map(Self)
    }
}

impl From<[u8; 32]> for Ed25519PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519PublicKey({})", self.to_base64())
    }
}

impl Display for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// A 64-byte Ed25519 signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ed25519Signature(pub [u8; 64]);

impl Ed25519Signature {
    pub fn to_base64(&self) -> String {
        STANDARD_NO_PAD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        decode_fixed::<64>(encoded).map(Self)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let array: [u8; 64] = bytes.try_into().map_err(|_| KeyError::InvalidLength {
            expected: 64,
            actual: bytes.len(),
        })?;
        Ok(Self(array))
    }
}

impl AsRef<[u8; 64]> for Ed25519Signature {
    fn as_ref(&self) -> &[u8; 64] {
        &self.0
    }
}

impl From<[u8; 64]> for Ed25519Signature {
    fn from(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }
}

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("signature verification failed")]
pub struct SignatureError;

/// The 32-byte seed an Ed25519 keypair is expanded from. This is the only
/// secret that needs storing; the public key is recomputed on load.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct SigningSeed([u8; 32]);

impl SigningSeed {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[allow(non_snake_case)]
    pub fn DANGER_to_bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl From<[u8; 32]> for SigningSeed {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Debug for SigningSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSeed(..redacted..)")
    }
}
