//! The primitive layer every ratchet is built on.
//!
//! A backend supplies HKDF, HMAC, SHA-256, ChaCha20-Poly1305, Ed25519 and a
//! CSPRNG. Everything above it (the pairwise ratchet, the group ratchet,
//! pickling) is written once against [`RatchetBackend`], so two backends
//! that agree on the primitives produce byte-identical ciphertexts, session
//! keys and pickles.
//!
//! Exactly one backend is active per process. It is chosen by
//! [`install`] at startup and never swapped afterwards.

mod native;
mod portable;

use std::{fmt, sync::OnceLock};

use crypto::{Ed25519PublicKey, Ed25519Signature, PublicKey, SignatureError, SigningSeed};
use serde::{Deserialize, Serialize};
use tracing::info;
use zeroize::Zeroizing;

pub use native::NativeBackend;
pub use portable::PortableBackend;

use crate::{
    account::Account,
    errors::{PickleError, RatchetError},
    pickle,
    session::PairwiseSession,
    types::{AeadKey, Nonce},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Pure-Rust primitives.
    #[default]
    Portable,
    /// Primitives from `ring`'s assembly implementations.
    Native,
}

impl BackendKind {
    fn instantiate(self) -> Box<dyn RatchetBackend> {
        match self {
            BackendKind::Portable => Box::new(PortableBackend),
            BackendKind::Native => Box::new(NativeBackend::new()),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Portable => f.write_str("portable"),
            BackendKind::Native => f.write_str("native"),
        }
    }
}

pub trait RatchetBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// HKDF-SHA256 extract-then-expand into `okm`. An empty `salt` is
    /// equivalent to a zero-filled one.
    fn hkdf_sha256(
        &self,
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
        okm: &mut [u8],
    ) -> Result<(), RatchetError>;

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<[u8; 32], RatchetError>;

    fn sha256(&self, data: &[u8]) -> [u8; 32];

    /// ChaCha20-Poly1305 seal. Returns ciphertext with the tag appended.
    fn aead_seal(
        &self,
        key: &AeadKey,
        nonce: &Nonce,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, RatchetError>;

    fn aead_open(
        &self,
        key: &AeadKey,
        nonce: &Nonce,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, RatchetError>;

    fn ed25519_public(&self, seed: &SigningSeed) -> Result<Ed25519PublicKey, RatchetError>;

    fn ed25519_sign(
        &self,
        seed: &SigningSeed,
        message: &[u8],
    ) -> Result<Ed25519Signature, RatchetError>;

    fn ed25519_verify(
        &self,
        key: &Ed25519PublicKey,
        message: &[u8],
        signature: &Ed25519Signature,
    ) -> Result<(), SignatureError>;

    fn fill_random(&self, buf: &mut [u8]) -> Result<(), RatchetError>;

    /// Create a fresh device account: identity keypair plus signing keypair.
    fn generate_identity(&self) -> Result<Account, RatchetError> {
        Account::generate(self)
    }

    /// Open a pairwise session towards a remote device using one of its
    /// claimed one-time keys.
    fn create_outbound_session(
        &self,
        account: &Account,
        remote_identity_key: PublicKey,
        remote_one_time_key: PublicKey,
    ) -> Result<PairwiseSession, RatchetError> {
        PairwiseSession::outbound(self, account, remote_identity_key, remote_one_time_key)
    }

    /// Accept a pre-key message. The consumed one-time key is removed from
    /// `account` only when the embedded message decrypts.
    fn create_inbound_session(
        &self,
        account: &mut Account,
        prekey_message: &[u8],
    ) -> Result<(PairwiseSession, Vec<u8>), RatchetError> {
        PairwiseSession::inbound(self, account, prekey_message)
    }

    /// Seal an encoded payload under `passphrase`.
    fn seal_pickle(&self, payload: &[u8], passphrase: &[u8]) -> Result<Vec<u8>, PickleError> {
        pickle::seal(self, payload, passphrase)
    }

    fn open_pickle(
        &self,
        sealed: &[u8],
        passphrase: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, PickleError> {
        pickle::open(self, sealed, passphrase)
    }
}

static ACTIVE: OnceLock<Box<dyn RatchetBackend>> = OnceLock::new();

/// Select the process-wide backend. Repeating the same choice is a no-op;
/// asking for a different one after the first call is an error.
pub fn install(kind: BackendKind) -> Result<&'static dyn RatchetBackend, RatchetError> {
    let backend = ACTIVE.get_or_init(|| {
        info!(backend = %kind, "installing ratchet backend");
        kind.instantiate()
    });
    if backend.kind() != kind {
        return Err(RatchetError::BackendMismatch {
            active: backend.kind(),
            requested: kind,
        });
    }
    Ok(backend.as_ref())
}

/// The installed backend, if any.
pub fn active() -> Option<&'static dyn RatchetBackend> {
    ACTIVE.get().map(|backend| backend.as_ref())
}

#[cfg(test)]
pub(crate) fn both() -> [Box<dyn RatchetBackend>; 2] {
    [
        BackendKind::Portable.instantiate(),
        BackendKind::Native.instantiate(),
    ]
}
