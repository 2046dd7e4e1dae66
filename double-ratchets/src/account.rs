use std::collections::BTreeMap;

use crypto::{Ed25519PublicKey, Ed25519Signature, PublicKey, SigningSeed};
use zeroize::{Zeroize, Zeroizing};

use crate::{
    backend::RatchetBackend,
    errors::RatchetError,
    keypair::InstallationKeyPair,
    pickle::Pickle,
    reader::Reader,
};

const ACCOUNT_PICKLE_VERSION: u8 = 1;

/// A device's long-term key material: the Curve25519 identity key, the
/// Ed25519 signing key and the pool of unclaimed one-time keys.
#[derive(Clone)]
pub struct Account {
    identity: InstallationKeyPair,
    signing_seed: SigningSeed,
    signing_key: Ed25519PublicKey,
    one_time_keys: BTreeMap<[u8; 32], InstallationKeyPair>,
}

impl Account {
    pub fn generate<B: RatchetBackend + ?Sized>(backend: &B) -> Result<Self, RatchetError> {
        let identity = InstallationKeyPair::generate(backend)?;

        let mut seed = [0u8; 32];
        backend.fill_random(&mut seed)?;
        let signing_seed = SigningSeed::from(seed);
        seed.zeroize();
        let signing_key = backend.ed25519_public(&signing_seed)?;

        Ok(Self {
            identity,
            signing_seed,
            signing_key,
            one_time_keys: BTreeMap::new(),
        })
    }

    pub fn identity(&self) -> &InstallationKeyPair {
        &self.identity
    }

    pub fn identity_key(&self) -> PublicKey {
        *self.identity.public()
    }

    pub fn signing_key(&self) -> Ed25519PublicKey {
        self.signing_key
    }

    pub fn sign<B: RatchetBackend + ?Sized>(
        &self,
        backend: &B,
        message: &[u8],
    ) -> Result<Ed25519Signature, RatchetError> {
        backend.ed25519_sign(&self.signing_seed, message)
    }

    /// Add `count` fresh one-time keys and return their public halves.
    pub fn generate_one_time_keys<B: RatchetBackend + ?Sized>(
        &mut self,
        backend: &B,
        count: usize,
    ) -> Result<Vec<PublicKey>, RatchetError> {
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            let pair = InstallationKeyPair::generate(backend)?;
            let public = *pair.public();
            self.one_time_keys.insert(public.to_bytes(), pair);
            created.push(public);
        }
        Ok(created)
    }

    pub fn one_time_keys(&self) -> Vec<PublicKey> {
        self.one_time_keys
            .values()
            .map(|pair| *pair.public())
            .collect()
    }

    pub fn one_time_key(&self, public: &PublicKey) -> Option<&InstallationKeyPair> {
        self.one_time_keys.get(public.as_bytes())
    }

    pub fn remove_one_time_key(&mut self, public: &PublicKey) -> Option<InstallationKeyPair> {
        self.one_time_keys.remove(public.as_bytes())
    }
}

impl Pickle for Account {
    const KIND: u8 = 0x01;

    fn encode(&self) -> Zeroizing<Vec<u8>> {
        let mut buf = Zeroizing::new(Vec::with_capacity(
            1 + 32 * 3 + 4 + self.one_time_keys.len() * 32,
        ));
        buf.push(ACCOUNT_PICKLE_VERSION);
        buf.extend_from_slice(&Zeroizing::new(self.identity.secret_bytes())[..]);
        buf.extend_from_slice(self.signing_seed.as_bytes());
        buf.extend_from_slice(self.signing_key.as_bytes());
        buf.extend_from_slice(&(self.one_time_keys.len() as u32).to_be_bytes());
        for pair in self.one_time_keys.values() {
            buf.extend_from_slice(&Zeroizing::new(pair.secret_bytes())[..]);
        }
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self, RatchetError> {
        let mut reader = Reader::new(bytes);
        if reader.read_u8()? != ACCOUNT_PICKLE_VERSION {
            return Err(RatchetError::DeserializationFailed);
        }
        let identity = InstallationKeyPair::from_secret_bytes(reader.read_array()?);
        let signing_seed = SigningSeed::from(reader.read_array::<32>()?);
        let signing_key = Ed25519PublicKey::from(reader.read_array::<32>()?);

        let count = reader.read_u32()?;
        let mut one_time_keys = BTreeMap::new();
        for _ in 0..count {
            let pair = InstallationKeyPair::from_secret_bytes(reader.read_array()?);
            one_time_keys.insert(pair.public().to_bytes(), pair);
        }
        reader.finish()?;

        Ok(Self {
            identity,
            signing_seed,
            signing_key,
            one_time_keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{NativeBackend, PortableBackend};

    #[test]
    fn test_signatures_verify() {
        let backend = PortableBackend;
        let account = Account::generate(&backend).unwrap();

        let sig = account.sign(&backend, b"device keys").unwrap();
        assert!(
            backend
                .ed25519_verify(&account.signing_key(), b"device keys", &sig)
                .is_ok()
        );
        assert!(
            NativeBackend::new()
                .ed25519_verify(&account.signing_key(), b"device keys", &sig)
                .is_ok()
        );
    }

    #[test]
    fn test_one_time_key_lifecycle() {
        let backend = PortableBackend;
        let mut account = Account::generate(&backend).unwrap();

        let created = account.generate_one_time_keys(&backend, 3).unwrap();
        assert_eq!(account.one_time_keys().len(), 3);
        assert!(account.one_time_key(&created[1]).is_some());

        assert!(account.remove_one_time_key(&created[1]).is_some());
        assert!(account.remove_one_time_key(&created[1]).is_none());
        assert_eq!(account.one_time_keys().len(), 2);
    }

    #[test]
    fn test_pickle_roundtrip() {
        let backend = PortableBackend;
        let mut account = Account::generate(&backend).unwrap();
        account.generate_one_time_keys(&backend, 2).unwrap();

        let sealed = account.pickle(&backend, b"device pass").unwrap();
        let restored = Account::unpickle(&backend, &sealed, b"device pass").unwrap();

        assert_eq!(restored.identity_key(), account.identity_key());
        assert_eq!(restored.signing_key(), account.signing_key());
        assert_eq!(restored.one_time_keys(), account.one_time_keys());
    }
}
