use crypto::{Ed25519PublicKey, Ed25519Signature, SignatureError, SigningSeed};
use ring::{
    aead::{Aad, CHACHA20_POLY1305, LessSafeKey, Nonce as RingNonce, UnboundKey},
    digest, hkdf, hmac,
    rand::{SecureRandom, SystemRandom},
    signature::{ED25519, Ed25519KeyPair, KeyPair, UnparsedPublicKey},
};

use super::{BackendKind, RatchetBackend};
use crate::{
    errors::RatchetError,
    types::{AeadKey, Nonce},
};

/// Output length marker for ring's HKDF expand step.
struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Primitives backed by `ring`.
#[derive(Debug)]
pub struct NativeBackend {
    rng: SystemRandom,
}

impl NativeBackend {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }

    fn aead_key(key: &AeadKey) -> Result<LessSafeKey, RatchetError> {
        let unbound =
            UnboundKey::new(&CHACHA20_POLY1305, key).map_err(|_| RatchetError::Primitive("aead"))?;
        Ok(LessSafeKey::new(unbound))
    }

    fn keypair(seed: &SigningSeed) -> Result<Ed25519KeyPair, RatchetError> {
        Ed25519KeyPair::from_seed_unchecked(seed.as_bytes())
            .map_err(|_| RatchetError::Primitive("ed25519"))
    }
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RatchetBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn hkdf_sha256(
        &self,
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
        okm: &mut [u8],
    ) -> Result<(), RatchetError> {
        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(ikm);
        let info = [info];
        prk.expand(&info, OkmLen(okm.len()))
            .and_then(|expanded| expanded.fill(okm))
            .map_err(|_| RatchetError::Primitive("hkdf"))
    }

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<[u8; 32], RatchetError> {
        let tag = hmac::sign(&hmac::Key::new(hmac::HMAC_SHA256, key), data);
        tag.as_ref()
            .try_into()
            .map_err(|_| RatchetError::Primitive("hmac"))
    }

    fn sha256(&self, data: &[u8]) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(digest::digest(&digest::SHA256, data).as_ref());
        out
    }

    fn aead_seal(
        &self,
        key: &AeadKey,
        nonce: &Nonce,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, RatchetError> {
        let key = Self::aead_key(key)?;
        let mut in_out = plaintext.to_vec();
        key.seal_in_place_append_tag(
            RingNonce::assume_unique_for_key(*nonce),
            Aad::from(aad),
            &mut in_out,
        )
        .map_err(|_| RatchetError::Primitive("aead"))?;
        Ok(in_out)
    }

    fn aead_open(
        &self,
        key: &AeadKey,
        nonce: &Nonce,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, RatchetError> {
        let key = Self::aead_key(key)?;
        let mut in_out = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(
                RingNonce::assume_unique_for_key(*nonce),
                Aad::from(aad),
                &mut in_out,
            )
            .map_err(|_| RatchetError::DecryptionFailed)?;
        Ok(plaintext.to_vec())
    }

    fn ed25519_public(&self, seed: &SigningSeed) -> Result<Ed25519PublicKey, RatchetError> {
        let pair = Self::keypair(seed)?;
        let bytes: [u8; 32] = pair
            .public_key()
            .as_ref()
            .try_into()
            .map_err(|_| RatchetError::Primitive("ed25519"))?;
        Ok(Ed25519PublicKey::from(bytes))
    }

    fn ed25519_sign(
        &self,
        seed: &SigningSeed,
        message: &[u8],
    ) -> Result<Ed25519Signature, RatchetError> {
        let pair = Self::keypair(seed)?;
        Ed25519Signature::from_slice(pair.sign(message).as_ref())
            .map_err(|_| RatchetError::Primitive("ed25519"))
    }

    fn ed25519_verify(
        &self,
        key: &Ed25519PublicKey,
        message: &[u8],
        signature: &Ed25519Signature,
    ) -> Result<(), SignatureError> {
        UnparsedPublicKey::new(&ED25519, key.as_bytes())
            .verify(message, &signature.0)
            .map_err(|_| SignatureError)
    }

    fn fill_random(&self, buf: &mut [u8]) -> Result<(), RatchetError> {
        self.rng
            .fill(buf)
            .map_err(|_| RatchetError::Primitive("rng"))
    }
}
