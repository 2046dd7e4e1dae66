use crypto::{PrivateKey, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{backend::RatchetBackend, errors::RatchetError, types::SharedSecret};

/// A Curve25519 keypair: identity keys, one-time keys, base keys and
/// ratchet keys all use this.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct InstallationKeyPair {
    secret: PrivateKey,
    public: PublicKey,
}

impl InstallationKeyPair {
    /// Generate a keypair from the backend's CSPRNG.
    pub fn generate<B: RatchetBackend + ?Sized>(backend: &B) -> Result<Self, RatchetError> {
        let mut bytes = [0u8; 32];
        backend.fill_random(&mut bytes)?;
        let pair = Self::from_secret_bytes(bytes);
        bytes.zeroize();
        Ok(pair)
    }

    pub fn dh(&self, their_public: &PublicKey) -> SharedSecret {
        self.secret.diffie_hellman(their_public).DANGER_to_bytes()
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret(&self) -> &PrivateKey {
        &self.secret
    }

    /// Export the secret key as raw bytes for pickling.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.DANGER_to_bytes()
    }

    /// Import the secret key from raw bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = PrivateKey::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }
}
