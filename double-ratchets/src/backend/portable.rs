use chacha20poly1305::{
    ChaCha20Poly1305, Key, KeyInit, Nonce as ChaChaNonce,
    aead::{Aead, Payload},
};
use crypto::{Ed25519PublicKey, Ed25519Signature, SignatureError, SigningSeed};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

use super::{BackendKind, RatchetBackend};
use crate::{
    errors::RatchetError,
    types::{AeadKey, Nonce},
};

/// RustCrypto primitives with the operating system RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortableBackend;

impl RatchetBackend for PortableBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Portable
    }

    fn hkdf_sha256(
        &self,
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
        okm: &mut [u8],
    ) -> Result<(), RatchetError> {
        Hkdf::<Sha256>::new(Some(salt), ikm)
            .expand(info, okm)
            .map_err(|_| RatchetError::Primitive("hkdf"))
    }

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<[u8; 32], RatchetError> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
            .map_err(|_| RatchetError::Primitive("hmac"))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }

    fn sha256(&self, data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    fn aead_seal(
        &self,
        key: &AeadKey,
        nonce: &Nonce,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, RatchetError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        cipher
            .encrypt(
                ChaChaNonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| RatchetError::Primitive("aead"))
    }

    fn aead_open(
        &self,
        key: &AeadKey,
        nonce: &Nonce,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, RatchetError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        cipher
            .decrypt(
                ChaChaNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| RatchetError::DecryptionFailed)
    }

    fn ed25519_public(&self, seed: &SigningSeed) -> Result<Ed25519PublicKey, RatchetError> {
        let signing = SigningKey::from_bytes(seed.as_bytes());
        Ok(Ed25519PublicKey::from(signing.verifying_key().to_bytes()))
    }

    fn ed25519_sign(
        &self,
        seed: &SigningSeed,
        message: &[u8],
    ) -> Result<Ed25519Signature, RatchetError> {
        let signing = SigningKey::from_bytes(seed.as_bytes());
        Ok(Ed25519Signature(signing.sign(message).to_bytes()))
    }

    fn ed25519_verify(
        &self,
        key: &Ed25519PublicKey,
        message: &[u8],
        signature: &Ed25519Signature,
    ) -> Result<(), SignatureError> {
        let verifying = VerifyingKey::from_bytes(key.as_bytes()).map_err(|_| SignatureError)?;
        verifying
            .verify_strict(message, &Signature::from_bytes(&signature.0))
            .map_err(|_| SignatureError)
    }

    fn fill_random(&self, buf: &mut [u8]) -> Result<(), RatchetError> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|_| RatchetError::Primitive("rng"))
    }
}
