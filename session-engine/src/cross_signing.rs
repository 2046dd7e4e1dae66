//! Cross-signing keys: a master key that signs a self-signing key (for our
//! own devices) and a user-signing key (for other users' master keys).

use std::collections::BTreeMap;

use crypto::{Ed25519PublicKey, Ed25519Signature, SigningSeed};
use double_ratchets::{RatchetBackend, RatchetError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroize;

use crate::errors::EngineError;

pub const USAGE_MASTER: &str = "master";
pub const USAGE_SELF_SIGNING: &str = "self_signing";
pub const USAGE_USER_SIGNING: &str = "user_signing";

/// The exportable secret half: three 32-byte seeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossSigningSeeds {
    #[serde(rename = "m.cross_signing.master", with = "unpadded_url")]
    pub master: SigningSeed,
    #[serde(rename = "m.cross_signing.self_signing", with = "unpadded_url")]
    pub self_signing: SigningSeed,
    #[serde(rename = "m.cross_signing.user_signing", with = "unpadded_url")]
    pub user_signing: SigningSeed,
}

mod unpadded_url {
    use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
    use crypto::SigningSeed;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use zeroize::{Zeroize, Zeroizing};

    pub fn serialize<S: Serializer>(seed: &SigningSeed, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(URL_SAFE_NO_PAD.encode(seed.as_bytes()));
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SigningSeed, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        let bytes = Zeroizing::new(
            URL_SAFE_NO_PAD
                .decode(encoded.as_bytes())
                .map_err(D::Error::custom)?,
        );
        let mut seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| D::Error::invalid_length(bytes.len(), &"a 32-byte seed"))?;
        let out = SigningSeed::from(seed);
        seed.zeroize();
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossSigningPublicKeys {
    pub master: Ed25519PublicKey,
    pub self_signing: Ed25519PublicKey,
    pub user_signing: Ed25519PublicKey,
}

/// A publishable cross-signing key object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossSigningKey {
    pub user_id: String,
    pub usage: Vec<String>,
    pub keys: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: BTreeMap<String, BTreeMap<String, String>>,
}

pub fn key_id(key: &Ed25519PublicKey) -> String {
    format!("ed25519:{}", key.to_base64())
}

impl CrossSigningKey {
    pub fn new(user_id: &str, usage: &str, key: &Ed25519PublicKey) -> Self {
        Self {
            user_id: user_id.to_string(),
            usage: vec![usage.to_string()],
            keys: BTreeMap::from([(key_id(key), key.to_base64())]),
            signatures: BTreeMap::new(),
        }
    }

    /// Sorted-key compact JSON of the object without its signatures; the
    /// bytes every signature covers.
    pub fn canonical_json(&self) -> Result<Vec<u8>, EngineError> {
        let unsigned = Self {
            signatures: BTreeMap::new(),
            ..self.clone()
        };
        let value = serde_json::to_value(&unsigned)?;
        Ok(serde_json::to_vec(&value)?)
    }

    pub fn add_signature(
        &mut self,
        signer_user_id: &str,
        signer_key_id: String,
        signature: &Ed25519Signature,
    ) {
        self.signatures
            .entry(signer_user_id.to_string())
            .or_default()
            .insert(signer_key_id, signature.to_base64());
    }

    /// Whether `signer`, filed under `signer_key_id` by `signer_user_id`,
    /// has validly signed this object.
    pub fn is_signed_by<B: RatchetBackend + ?Sized>(
        &self,
        backend: &B,
        signer_user_id: &str,
        signer_key_id: &str,
        signer: &Ed25519PublicKey,
    ) -> Result<bool, EngineError> {
        let Some(encoded) = self
            .signatures
            .get(signer_user_id)
            .and_then(|by_key| by_key.get(signer_key_id))
        else {
            return Ok(false);
        };
        let Ok(signature) = Ed25519Signature::from_base64(encoded) else {
            return Ok(false);
        };
        let message = self.canonical_json()?;
        Ok(backend.ed25519_verify(signer, &message, &signature).is_ok())
    }
}

/// The three key objects as uploaded. The device signs the master key and
/// the master key signs the other two.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossSigningUpload {
    pub master: CrossSigningKey,
    pub self_signing: CrossSigningKey,
    pub user_signing: CrossSigningKey,
}

/// The three cross-signing keypairs. Never rotated in place: rotating means
/// generating a fresh set and publishing it.
pub struct CrossSigningKeys {
    seeds: CrossSigningSeeds,
    public: CrossSigningPublicKeys,
}

fn random_seed<B: RatchetBackend + ?Sized>(backend: &B) -> Result<SigningSeed, RatchetError> {
    let mut bytes = [0u8; 32];
    backend.fill_random(&mut bytes)?;
    let seed = SigningSeed::from(bytes);
    bytes.zeroize();
    Ok(seed)
}

impl CrossSigningKeys {
    pub fn generate<B: RatchetBackend + ?Sized>(backend: &B) -> Result<Self, RatchetError> {
        let keys = Self::from_seeds(
            backend,
            CrossSigningSeeds {
                master: random_seed(backend)?,
                self_signing: random_seed(backend)?,
                user_signing: random_seed(backend)?,
            },
        )?;
        info!(
            master = %keys.public.master,
            self_signing = %keys.public.self_signing,
            user_signing = %keys.public.user_signing,
            "generated cross-signing keys"
        );
        Ok(keys)
    }

    /// Rebuild the keypairs from exported seeds, e.g. on a new device.
    pub fn import<B: RatchetBackend + ?Sized>(
        backend: &B,
        seeds: CrossSigningSeeds,
    ) -> Result<Self, RatchetError> {
        let keys = Self::from_seeds(backend, seeds)?;
        debug!(master = %keys.public.master, "imported cross-signing keys");
        Ok(keys)
    }

    fn from_seeds<B: RatchetBackend + ?Sized>(
        backend: &B,
        seeds: CrossSigningSeeds,
    ) -> Result<Self, RatchetError> {
        let public = CrossSigningPublicKeys {
            master: backend.ed25519_public(&seeds.master)?,
            self_signing: backend.ed25519_public(&seeds.self_signing)?,
            user_signing: backend.ed25519_public(&seeds.user_signing)?,
        };
        Ok(Self { seeds, public })
    }

    pub fn export(&self) -> CrossSigningSeeds {
        self.seeds.clone()
    }

    pub fn public_keys(&self) -> CrossSigningPublicKeys {
        self.public
    }

    /// Sign `key` with the master key and attach the signature.
    pub fn sign_with_master<B: RatchetBackend + ?Sized>(
        &self,
        backend: &B,
        user_id: &str,
        key: &mut CrossSigningKey,
    ) -> Result<Ed25519Signature, EngineError> {
        let signature = backend.ed25519_sign(&self.seeds.master, &key.canonical_json()?)?;
        key.add_signature(user_id, key_id(&self.public.master), &signature);
        Ok(signature)
    }
}

#[cfg(test)]
mod tests {
    use double_ratchets::PortableBackend;

    use super::*;

    const USER: &str = "@alice:example.org";

    #[test]
    fn test_export_import_keeps_public_keys() {
        let backend = PortableBackend;
        let keys = CrossSigningKeys::generate(&backend).unwrap();
        let json = serde_json::to_string(&keys.export()).unwrap();

        let seeds: CrossSigningSeeds = serde_json::from_str(&json).unwrap();
        let restored = CrossSigningKeys::import(&backend, seeds).unwrap();
        assert_eq!(restored.public_keys(), keys.public_keys());
        assert_ne!(keys.public_keys().master, keys.public_keys().self_signing);
    }

    #[test]
    fn test_seed_json_format() {
        let seeds = CrossSigningSeeds {
            master: SigningSeed::from([0xFF; 32]),
            self_signing: SigningSeed::from([0x00; 32]),
            user_signing: SigningSeed::from([0xFB; 32]),
        };
        let value = serde_json::to_value(&seeds).unwrap();
        let master = value["m.cross_signing.master"].as_str().unwrap();
        assert_eq!(master.len(), 43);
        assert!(!master.contains('='));
        assert!(master.contains('_'));
        assert!(value["m.cross_signing.self_signing"].is_string());
        assert!(value["m.cross_signing.user_signing"].is_string());

        let short = r#"{"m.cross_signing.master":"AAAA",
            "m.cross_signing.self_signing":"AAAA",
            "m.cross_signing.user_signing":"AAAA"}"#;
        assert!(serde_json::from_str::<CrossSigningSeeds>(short).is_err());
    }

    #[test]
    fn test_sub_keys_are_signed_by_master() {
        let backend = PortableBackend;
        let keys = CrossSigningKeys::generate(&backend).unwrap();
        let public = keys.public_keys();
        let master_id = key_id(&public.master);

        let mut self_signing = CrossSigningKey::new(USER, USAGE_SELF_SIGNING, &public.self_signing);
        let signature = keys.sign_with_master(&backend, USER, &mut self_signing).unwrap();
        assert_eq!(self_signing.signatures[USER][&master_id], signature.to_base64());
        assert!(self_signing.is_signed_by(&backend, USER, &master_id, &public.master).unwrap());
        assert!(!self_signing.is_signed_by(&backend, USER, "ed25519:DEVICE", &public.master).unwrap());

        let mut tampered = self_signing.clone();
        tampered.user_id = "@mallory:example.org".into();
        assert!(!tampered.is_signed_by(&backend, USER, &master_id, &public.master).unwrap());
    }

    #[test]
    fn test_canonical_json_is_sorted_and_unsigned() {
        let key = CrossSigningKey::new(USER, USAGE_MASTER, &Ed25519PublicKey::from([1u8; 32]));
        let mut signed = key.clone();
        signed.add_signature(USER, "ed25519:DEVICE".into(), &Ed25519Signature::from([2u8; 64]));

        let json = String::from_utf8(signed.canonical_json().unwrap()).unwrap();
        assert_eq!(json, String::from_utf8(key.canonical_json().unwrap()).unwrap());
        assert!(json.starts_with(r#"{"keys":{"ed25519:"#));
        assert!(json.ends_with(r#""usage":["master"],"user_id":"@alice:example.org"}"#));
    }
}
