use crypto::HandshakeSecret;

use crate::{
    backend::RatchetBackend,
    errors::RatchetError,
    types::{ChainKey, MessageKey, RootKey, SharedSecret},
};

/// Trait for defining the domain parameters for the pairwise KDFs
pub trait HkdfInfo {
    /// Info string turning the handshake secret into the first root and chain keys.
    const HANDSHAKE: &'static [u8];
    const ROOT_KEY: &'static [u8];
    const MESSAGE_KEY: &'static [u8];
    const CHAIN_KEY: &'static [u8];
    /// Info string expanding a message key into an AEAD key and nonce.
    const MESSAGE_KEYS: &'static [u8];
}

/// Parameters for device-to-device sessions.
#[derive(Clone, Copy, Debug)]
pub struct PairwiseDomain;

impl HkdfInfo for PairwiseDomain {
    const HANDSHAKE: &'static [u8] = b"OLM_ROOT";
    const ROOT_KEY: &'static [u8] = b"OLM_RATCHET";
    const MESSAGE_KEY: &'static [u8] = &[0x01];
    const CHAIN_KEY: &'static [u8] = &[0x02];
    const MESSAGE_KEYS: &'static [u8] = b"OLM_KEYS";
}

fn split_64(okm: &[u8; 64]) -> ([u8; 32], [u8; 32]) {
    let mut left = [0u8; 32];
    let mut right = [0u8; 32];
    left.copy_from_slice(&okm[..32]);
    right.copy_from_slice(&okm[32..]);
    (left, right)
}

/// Derive the initial root key and the initiator's sending chain from the
/// handshake output.
pub fn kdf_handshake<D: HkdfInfo, B: RatchetBackend + ?Sized>(
    backend: &B,
    secret: &HandshakeSecret,
) -> Result<(RootKey, ChainKey), RatchetError> {
    let mut okm = [0u8; 64];
    backend.hkdf_sha256(&[], secret.as_bytes(), D::HANDSHAKE, &mut okm)?;
    Ok(split_64(&okm))
}

/// Derive a new root key and chain key from the given root key and Diffie-Hellman shared secret.
///
/// # Arguments
///
/// * `root` - The current root key, used as the HKDF salt.
/// * `dh` - The Diffie-Hellman shared secret.
///
/// # Returns
///
/// A tuple containing the new root key and chain key.
pub fn kdf_root<D: HkdfInfo, B: RatchetBackend + ?Sized>(
    backend: &B,
    root: &RootKey,
    dh: &SharedSecret,
) -> Result<(RootKey, ChainKey), RatchetError> {
    let mut okm = [0u8; 64];
    backend.hkdf_sha256(root, dh, D::ROOT_KEY, &mut okm)?;
    Ok(split_64(&okm))
}

/// Step a chain key.
///
/// # Returns
///
/// A tuple containing the new chain key and message key.
pub fn kdf_chain<D: HkdfInfo, B: RatchetBackend + ?Sized>(
    backend: &B,
    chain: &ChainKey,
) -> Result<(ChainKey, MessageKey), RatchetError> {
    let msg_key = backend.hmac_sha256(chain, D::MESSAGE_KEY)?;
    let next_chain = backend.hmac_sha256(chain, D::CHAIN_KEY)?;
    Ok((next_chain, msg_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::both;

    #[test]
    fn test_kdf_root_deterministic_output() {
        let root = [0x11; 32];
        let dh = [0x22; 32];

        let expected_new_root = [
            39, 248, 211, 4, 81, 165, 130, 119, 54, 187, 19, 129, 224, 231, 185, 53, 104, 255,
            226, 124, 125, 81, 52, 142, 197, 32, 78, 169, 147, 248, 74, 132,
        ];
        let expected_chain = [
            131, 3, 88, 48, 167, 221, 245, 153, 56, 63, 12, 36, 103, 42, 104, 1, 100, 12, 62,
            204, 240, 63, 116, 74, 93, 147, 18, 5, 26, 156, 144, 89,
        ];

        for backend in both() {
            let (new_root, chain) =
                kdf_root::<PairwiseDomain, _>(&*backend, &root, &dh).unwrap();
            assert_eq!(new_root, expected_new_root);
            assert_eq!(chain, expected_chain);
        }
    }

    #[test]
    fn test_kdf_chain_deterministic() {
        let chain = [0xff; 32];

        let expected_msg_key = [
            133, 211, 176, 125, 218, 254, 120, 146, 92, 183, 140, 100, 232, 79, 174, 84, 194, 132,
            32, 52, 208, 184, 140, 198, 214, 159, 184, 209, 6, 227, 255, 200,
        ];
        let expected_next_chain = [
            242, 23, 103, 225, 142, 166, 5, 5, 118, 199, 34, 38, 80, 134, 74, 25, 237, 148, 28,
            147, 130, 101, 171, 210, 85, 172, 121, 190, 239, 160, 69, 70,
        ];

        for backend in both() {
            let (next_chain, msg_key) =
                kdf_chain::<PairwiseDomain, _>(&*backend, &chain).unwrap();
            assert_eq!(msg_key, expected_msg_key);
            assert_eq!(next_chain, expected_next_chain);
        }
    }

    #[test]
    fn test_kdf_chain_sequence() {
        let [backend, _] = both();
        let initial_chain = [0xaa; 32];

        let backend = &*backend;

        let (chain2, msg_key1) = kdf_chain::<PairwiseDomain, _>(backend, &initial_chain).unwrap();
        let (chain3, msg_key2) = kdf_chain::<PairwiseDomain, _>(backend, &chain2).unwrap();
        let (_, msg_key3) = kdf_chain::<PairwiseDomain, _>(backend, &chain3).unwrap();

        assert_ne!(msg_key1, msg_key2);
        assert_ne!(msg_key2, msg_key3);
        assert_ne!(initial_chain, chain2);
        assert_ne!(chain2, chain3);
        assert_ne!(msg_key1, chain2);
    }

    #[test]
    fn test_handshake_domain_separated_from_ratchet() {
        let [backend, _] = both();
        let secret = HandshakeSecret::from([0x42; 96]);

        let (root, chain) =
            kdf_handshake::<PairwiseDomain, _>(&*backend, &secret).unwrap();
        assert_ne!(root, chain);

        let (ratchet_root, _) =
            kdf_root::<PairwiseDomain, _>(&*backend, &root, &[0x42; 32]).unwrap();
        assert_ne!(ratchet_root, root);
    }
}
