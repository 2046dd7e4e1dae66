//! Passphrase-sealed persistence for accounts and sessions.
//!
//! ```text
//! | Field    | Size (bytes) | Description                                  |
//! |----------|--------------|----------------------------------------------|
//! | version  | 1            | Envelope version (0x01)                      |
//! | salt     | 16           | Random per pickle                            |
//! | check    | 8            | Passphrase check value                       |
//! | sealed   | n + 16       | ChaCha20-Poly1305 over kind byte + payload   |
//! ```
//!
//! Key, nonce and check value are expanded together from the passphrase
//! with HKDF-SHA256, so a wrong passphrase is reported as such without
//! touching the ciphertext.

use zeroize::{Zeroize, Zeroizing};

use crate::{
    backend::RatchetBackend,
    errors::{PickleError, RatchetError},
    types::TAG_LEN,
};

const ENVELOPE_VERSION: u8 = 0x01;
const SALT_LEN: usize = 16;
const CHECK_LEN: usize = 8;
const HEADER_LEN: usize = 1 + SALT_LEN + CHECK_LEN;
const PICKLE_INFO: &[u8] = b"Pickle";

/// Objects that can be sealed under a passphrase.
pub trait Pickle: Sized {
    /// Distinguishes object types sharing one envelope format.
    const KIND: u8;

    fn encode(&self) -> Zeroizing<Vec<u8>>;

    fn decode(bytes: &[u8]) -> Result<Self, RatchetError>;

    fn pickle<B: RatchetBackend + ?Sized>(
        &self,
        backend: &B,
        passphrase: &[u8],
    ) -> Result<Vec<u8>, PickleError> {
        let encoded = self.encode();
        let mut payload = Zeroizing::new(Vec::with_capacity(1 + encoded.len()));
        payload.push(Self::KIND);
        payload.extend_from_slice(&encoded);
        backend.seal_pickle(&payload, passphrase)
    }

    fn unpickle<B: RatchetBackend + ?Sized>(
        backend: &B,
        sealed: &[u8],
        passphrase: &[u8],
    ) -> Result<Self, PickleError> {
        let payload = backend.open_pickle(sealed, passphrase)?;
        match payload.split_first() {
            Some((&kind, body)) if kind == Self::KIND => {
                Self::decode(body).map_err(|_| PickleError::CorruptData)
            }
            _ => Err(PickleError::CorruptData),
        }
    }
}

struct PickleKeys {
    key: [u8; 32],
    nonce: [u8; 12],
    check: [u8; CHECK_LEN],
}

impl Drop for PickleKeys {
    fn drop(&mut self) {
        self.key.zeroize();
        self.nonce.zeroize();
    }
}

fn derive<B: RatchetBackend + ?Sized>(
    backend: &B,
    passphrase: &[u8],
    salt: &[u8],
) -> Result<PickleKeys, PickleError> {
    if passphrase.is_empty() {
        return Err(PickleError::NoKeyProvided);
    }
    let mut okm = Zeroizing::new([0u8; 32 + 12 + CHECK_LEN]);
    backend
        .hkdf_sha256(salt, passphrase, PICKLE_INFO, &mut okm[..])
        .map_err(|_| PickleError::Backend)?;

    let mut keys = PickleKeys {
        key: [0u8; 32],
        nonce: [0u8; 12],
        check: [0u8; CHECK_LEN],
    };
    keys.key.copy_from_slice(&okm[..32]);
    keys.nonce.copy_from_slice(&okm[32..44]);
    keys.check.copy_from_slice(&okm[44..]);
    Ok(keys)
}

pub(crate) fn seal<B: RatchetBackend + ?Sized>(
    backend: &B,
    payload: &[u8],
    passphrase: &[u8],
) -> Result<Vec<u8>, PickleError> {
    let mut salt = [0u8; SALT_LEN];
    backend
        .fill_random(&mut salt)
        .map_err(|_| PickleError::Backend)?;
    let keys = derive(backend, passphrase, &salt)?;

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + TAG_LEN);
    out.push(ENVELOPE_VERSION);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&keys.check);

    let sealed = backend
        .aead_seal(&keys.key, &keys.nonce, &out, payload)
        .map_err(|_| PickleError::Backend)?;
    out.extend_from_slice(&sealed);
    Ok(out)
}

pub(crate) fn open<B: RatchetBackend + ?Sized>(
    backend: &B,
    sealed: &[u8],
    passphrase: &[u8],
) -> Result<Zeroizing<Vec<u8>>, PickleError> {
    if passphrase.is_empty() {
        return Err(PickleError::NoKeyProvided);
    }
    if sealed.len() < HEADER_LEN + TAG_LEN || sealed[0] != ENVELOPE_VERSION {
        return Err(PickleError::CorruptData);
    }
    let (header, ciphertext) = sealed.split_at(HEADER_LEN);
    let salt = &header[1..1 + SALT_LEN];
    let check = &header[1 + SALT_LEN..];

    let keys = derive(backend, passphrase, salt)?;
    if keys.check[..] != *check {
        return Err(PickleError::BadPassphrase);
    }

    backend
        .aead_open(&keys.key, &keys.nonce, header, ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| PickleError::CorruptData)
}
