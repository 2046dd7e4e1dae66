use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    backend::RatchetBackend,
    errors::RatchetError,
    types::{AeadKey, Nonce},
};

/// AEAD key and nonce expanded from a single ratchet output.
///
/// Every message key is used exactly once, so deriving the nonce from it is
/// safe and makes ciphertexts a pure function of ratchet state.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MessageKeys {
    key: AeadKey,
    nonce: Nonce,
}

impl MessageKeys {
    /// Expand `secret` with HKDF-SHA256 under `info`.
    pub fn derive<B: RatchetBackend + ?Sized>(
        backend: &B,
        secret: &[u8],
        info: &[u8],
    ) -> Result<Self, RatchetError> {
        let mut okm = [0u8; 44];
        backend.hkdf_sha256(&[], secret, info, &mut okm)?;

        let mut keys = Self {
            key: [0u8; 32],
            nonce: [0u8; 12],
        };
        keys.key.copy_from_slice(&okm[..32]);
        keys.nonce.copy_from_slice(&okm[32..]);
        okm.zeroize();
        Ok(keys)
    }

    pub fn seal<B: RatchetBackend + ?Sized>(
        &self,
        backend: &B,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, RatchetError> {
        backend.aead_seal(&self.key, &self.nonce, aad, plaintext)
    }

    pub fn open<B: RatchetBackend + ?Sized>(
        &self,
        backend: &B,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, RatchetError> {
        backend.aead_open(&self.key, &self.nonce, aad, ciphertext)
    }
}
