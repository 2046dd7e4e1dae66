use std::fmt::{self, Debug, Display};

use base64::{Engine, engine::general_purpose::STANDARD_NO_PAD};
use rand_core::{CryptoRng, RngCore};
use x25519_dalek::{PublicKey as x25519_Pub, StaticSecret as x25519_Priv};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Errors raised while decoding key material from its transport encoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key is not valid unpadded base64")]
    InvalidEncoding,
    #[error("expected {expected} key bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

pub(crate) fn decode_fixed<const N: usize>(encoded: &str) -> Result<[u8; N], KeyError> {
    let bytes = STANDARD_NO_PAD
        .decode(encoded)
        .map_err(|_| KeyError::InvalidEncoding)?;
    let actual = bytes.len();
    bytes
        .try_into()
        .map_err(|_| KeyError::InvalidLength { expected: N, actual })
}

/// A Curve25519 public key. Identity keys, one-time keys, base keys and
/// ratchet keys all travel as this type.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Zeroize)]
pub struct PublicKey(x25519_Pub);

impl PublicKey {
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Unpadded standard base64, the form used for sender keys on the wire
    /// and as store keys.
    pub fn to_base64(&self) -> String {
        STANDARD_NO_PAD.encode(self.0.as_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        Ok(Self::from(decode_fixed::<32>(encoded)?))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let array: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self::from(array))
    }
}

impl From<x25519_Pub> for PublicKey {
    fn from(value: x25519_Pub) -> Self {
        Self(value)
    }
}

impl From<[u8; 32]> for PublicKey {
    fn from(value: [u8; 32]) -> Self {
        Self(x25519_Pub::from(value))
    }
}

impl From<&PrivateKey> for PublicKey {
    fn from(value: &PrivateKey) -> Self {
        Self(x25519_Pub::from(&value.0))
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey(x25519_Priv);

impl PrivateKey {
    pub fn random_from_rng<T: RngCore + CryptoRng>(csprng: T) -> Self {
        Self(x25519_Priv::random_from_rng(csprng))
    }

    pub fn diffie_hellman(&self, public_key: &PublicKey) -> SymmetricKey32 {
        self.0.diffie_hellman(&public_key.0).to_bytes().into()
    }

    #[allow(non_snake_case)] // All caps makes this standout more in reviews.
    pub fn DANGER_to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

impl From<[u8; 32]> for PrivateKey {
    fn from(value: [u8; 32]) -> Self {
        Self(x25519_Priv::from(value))
    }
}

impl Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..redacted..)")
    }
}

/// A Generic secret key container for symmetric keys.
/// SymmetricKey retains ownership of bytes to ensure they are Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct SymmetricKey<const N: usize>([u8; N]);

impl<const N: usize> SymmetricKey<N> {
    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }

    /// Returns internal [u8; N].
    /// This function by passes zeroize_on_drop, callers own the copy.
    #[allow(nonstandard_style)]
    pub fn DANGER_to_bytes(&self) -> [u8; N] {
        self.0
    }
}

impl<const N: usize> From<[u8; N]> for SymmetricKey<N> {
    fn from(value: [u8; N]) -> Self {
        SymmetricKey(value)
    }
}

impl<const N: usize> Debug for SymmetricKey<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmetricKey(...{N} Bytes Redacted...)")
    }
}

pub type SymmetricKey32 = SymmetricKey<32>;
