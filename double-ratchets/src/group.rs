//! Group sessions: a forward-only hash ratchet shared with every member of a
//! room, with each message signed by the sender's per-session Ed25519 key.

use base64::{Engine, engine::general_purpose::STANDARD_NO_PAD};
use crypto::{Ed25519PublicKey, Ed25519Signature, SigningSeed};
use proto::{GroupMessage, decode_versioned, encode_versioned};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{
    aead::MessageKeys,
    backend::RatchetBackend,
    errors::RatchetError,
    pickle::Pickle,
    reader::Reader,
};

pub const RATCHET_LEN: usize = 128;
const PART_LEN: usize = 32;
const PARTS: usize = 4;

const SIGNATURE_LEN: usize = 64;
const MEGOLM_KEYS_INFO: &[u8] = b"MEGOLM_KEYS";

const SESSION_KEY_VERSION: u8 = 0x02;
const SESSION_KEY_SIGNED_LEN: usize = 1 + 4 + RATCHET_LEN + 32;
/// Length of a decoded session key, signature included.
pub const SESSION_KEY_LEN: usize = SESSION_KEY_SIGNED_LEN + SIGNATURE_LEN;

const GROUP_PICKLE_VERSION: u8 = 1;

/// Four 32-byte parts `R(0)..R(3)` and a message counter.
///
/// `R(i)` is rehashed every `2^(8 * (3 - i))` messages and, when it is,
/// all lower-order parts are rederived from it. A holder of the ratchet at
/// index `n` can reach any `m >= n` but nothing earlier.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct GroupRatchet {
    data: [u8; RATCHET_LEN],
    counter: u32,
}

impl GroupRatchet {
    pub fn new(data: [u8; RATCHET_LEN], counter: u32) -> Self {
        Self { data, counter }
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn as_bytes(&self) -> &[u8; RATCHET_LEN] {
        &self.data
    }

    /// `R(to) = HMAC(R(from), [to])`
    fn rehash_part<B: RatchetBackend + ?Sized>(
        &mut self,
        backend: &B,
        from: usize,
        to: usize,
    ) -> Result<(), RatchetError> {
        let key = &self.data[from * PART_LEN..(from + 1) * PART_LEN];
        let mut next = backend.hmac_sha256(key, &[to as u8])?;
        self.data[to * PART_LEN..(to + 1) * PART_LEN].copy_from_slice(&next);
        next.zeroize();
        Ok(())
    }

    /// Step forward by one message.
    pub fn advance<B: RatchetBackend + ?Sized>(&mut self, backend: &B) -> Result<(), RatchetError> {
        let mut mask: u32 = 0x00FF_FFFF;
        let mut h = 0;

        self.counter = self.counter.wrapping_add(1);

        // The highest-order part whose period boundary was just crossed.
        while h < PARTS {
            if self.counter & mask == 0 {
                break;
            }
            h += 1;
            mask >>= 8;
        }

        for i in (h..PARTS).rev() {
            self.rehash_part(backend, h, i)?;
        }
        Ok(())
    }

    /// Jump forward to `target` in at most `4 * 256` rehashes.
    ///
    /// A `target` below the current counter is treated as having wrapped
    /// around `u32::MAX`.
    pub fn advance_to<B: RatchetBackend + ?Sized>(
        &mut self,
        backend: &B,
        target: u32,
    ) -> Result<(), RatchetError> {
        for j in 0..PARTS {
            let shift = (PARTS - j - 1) * 8;
            let mask = u32::MAX << shift;

            let mut steps = (target >> shift).wrapping_sub(self.counter >> shift) & 0xff;
            if steps == 0 {
                if target < self.counter {
                    steps = 0x100;
                } else {
                    continue;
                }
            }

            // All but the last step only touch R(j) itself.
            while steps > 1 {
                self.rehash_part(backend, j, j)?;
                steps -= 1;
            }
            for k in (j..PARTS).rev() {
                self.rehash_part(backend, j, k)?;
            }
            self.counter = target & mask;
        }
        Ok(())
    }

    fn message_keys<B: RatchetBackend + ?Sized>(
        &self,
        backend: &B,
    ) -> Result<MessageKeys, RatchetError> {
        MessageKeys::derive(backend, &self.data, MEGOLM_KEYS_INFO)
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, RatchetError> {
        let counter = reader.read_u32()?;
        let data = reader.read_array()?;
        Ok(Self { data, counter })
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.counter.to_be_bytes());
        buf.extend_from_slice(&self.data);
    }
}

/// Ratchet state at a given index together with the signing key, as handed
/// to legacy import/export codecs. Carries no signature.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ExportedRatchet {
    pub index: u32,
    pub ratchet: [u8; RATCHET_LEN],
    #[zeroize(skip)]
    pub signing_key: Ed25519PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPlaintext {
    pub plaintext: Vec<u8>,
    pub message_index: u32,
}

/// The index a group message claims to be sent at. The signature is not
/// checked, so the result is only a hint for requesting keys.
pub fn peek_message_index(message: &[u8]) -> Result<u32, RatchetError> {
    if message.len() <= SIGNATURE_LEN {
        return Err(RatchetError::MalformedMessage);
    }
    let decoded: GroupMessage = decode_versioned(&message[..message.len() - SIGNATURE_LEN])?;
    Ok(decoded.message_index)
}

/// The sending side of a group session.
#[derive(Clone)]
pub struct OutboundGroupSession {
    ratchet: GroupRatchet,
    signing_seed: SigningSeed,
    signing_key: Ed25519PublicKey,
}

impl OutboundGroupSession {
    pub fn new<B: RatchetBackend + ?Sized>(backend: &B) -> Result<Self, RatchetError> {
        let mut data = [0u8; RATCHET_LEN];
        backend.fill_random(&mut data)?;
        let ratchet = GroupRatchet::new(data, 0);
        data.zeroize();

        let mut seed = [0u8; 32];
        backend.fill_random(&mut seed)?;
        let signing_seed = SigningSeed::from(seed);
        seed.zeroize();
        let signing_key = backend.ed25519_public(&signing_seed)?;

        Ok(Self {
            ratchet,
            signing_seed,
            signing_key,
        })
    }

    /// Base64 of the session's signing key.
    pub fn session_id(&self) -> String {
        self.signing_key.to_base64()
    }

    pub fn signing_key(&self) -> Ed25519PublicKey {
        self.signing_key
    }

    /// Index the next message will be sent at.
    pub fn message_index(&self) -> u32 {
        self.ratchet.counter()
    }

    /// Encrypt and sign one message, then advance the ratchet.
    pub fn encrypt<B: RatchetBackend + ?Sized>(
        &mut self,
        backend: &B,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, RatchetError> {
        let keys = self.ratchet.message_keys(backend)?;
        let ciphertext = keys.seal(backend, plaintext, &[])?;

        let mut out = encode_versioned(&GroupMessage {
            message_index: self.ratchet.counter(),
            ciphertext,
        });
        let signature = backend.ed25519_sign(&self.signing_seed, &out)?;
        out.extend_from_slice(&signature.0);

        self.ratchet.advance(backend)?;
        Ok(out)
    }

    /// The signed key handed to recipients so they can build an
    /// [`InboundGroupSession`] starting at the current index.
    pub fn session_key<B: RatchetBackend + ?Sized>(
        &self,
        backend: &B,
    ) -> Result<String, RatchetError> {
        let mut buf = Zeroizing::new(Vec::with_capacity(SESSION_KEY_LEN));
        buf.push(SESSION_KEY_VERSION);
        self.ratchet.write(&mut buf);
        buf.extend_from_slice(self.signing_key.as_bytes());

        let signature = backend.ed25519_sign(&self.signing_seed, &buf)?;
        buf.extend_from_slice(&signature.0);
        Ok(STANDARD_NO_PAD.encode(&buf[..]))
    }
}

impl Pickle for OutboundGroupSession {
    const KIND: u8 = 0x03;

    fn encode(&self) -> Zeroizing<Vec<u8>> {
        let mut buf = Zeroizing::new(Vec::with_capacity(1 + 4 + RATCHET_LEN + 64));
        buf.push(GROUP_PICKLE_VERSION);
        self.ratchet.write(&mut buf);
        buf.extend_from_slice(self.signing_seed.as_bytes());
        buf.extend_from_slice(self.signing_key.as_bytes());
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self, RatchetError> {
        let mut reader = Reader::new(bytes);
        if reader.read_u8()? != GROUP_PICKLE_VERSION {
            return Err(RatchetError::DeserializationFailed);
        }
        let ratchet = GroupRatchet::read(&mut reader)?;
        let signing_seed = SigningSeed::from(reader.read_array::<32>()?);
        let signing_key = Ed25519PublicKey::from(reader.read_array::<32>()?);
        reader.finish()?;
        Ok(Self {
            ratchet,
            signing_seed,
            signing_key,
        })
    }
}

/// The receiving side of a group session.
#[derive(Clone)]
pub struct InboundGroupSession {
    initial: GroupRatchet,
    signing_key: Ed25519PublicKey,
    signing_key_verified: bool,
}

impl InboundGroupSession {
    /// Build from a signed session key. The embedded signature is checked
    /// against the embedded signing key.
    pub fn from_session_key<B: RatchetBackend + ?Sized>(
        backend: &B,
        session_key: &str,
    ) -> Result<Self, RatchetError> {
        let bytes = Zeroizing::new(
            STANDARD_NO_PAD
                .decode(session_key)
                .map_err(|_| RatchetError::InvalidKey)?,
        );
        if bytes.len() != SESSION_KEY_LEN || bytes[0] != SESSION_KEY_VERSION {
            return Err(RatchetError::InvalidKey);
        }
        let (signed, signature) = bytes.split_at(SESSION_KEY_SIGNED_LEN);

        let mut reader = Reader::new(&signed[1..]);
        let initial = GroupRatchet::read(&mut reader)?;
        let signing_key = Ed25519PublicKey::from(reader.read_array::<32>()?);
        reader.finish()?;

        let signature = Ed25519Signature::from_slice(signature)?;
        backend
            .ed25519_verify(&signing_key, signed, &signature)
            .map_err(|_| RatchetError::BadSignature)?;

        Ok(Self {
            initial,
            signing_key,
            signing_key_verified: true,
        })
    }

    /// Build from an unsigned export. The signing key is taken on trust.
    pub fn import(exported: &ExportedRatchet) -> Self {
        Self {
            initial: GroupRatchet::new(exported.ratchet, exported.index),
            signing_key: exported.signing_key,
            signing_key_verified: false,
        }
    }

    pub fn session_id(&self) -> String {
        self.signing_key.to_base64()
    }

    pub fn signing_key(&self) -> Ed25519PublicKey {
        self.signing_key
    }

    /// Whether the signing key was proven by a signed session key.
    pub fn is_verified(&self) -> bool {
        self.signing_key_verified
    }

    pub fn first_known_index(&self) -> u32 {
        self.initial.counter()
    }

    /// Export the ratchet at `index`, which must not precede the first
    /// known index.
    pub fn export_at<B: RatchetBackend + ?Sized>(
        &self,
        backend: &B,
        index: u32,
    ) -> Result<ExportedRatchet, RatchetError> {
        let ratchet = self.ratchet_at(backend, index)?;
        Ok(ExportedRatchet {
            index,
            ratchet: *ratchet.as_bytes(),
            signing_key: self.signing_key,
        })
    }

    fn ratchet_at<B: RatchetBackend + ?Sized>(
        &self,
        backend: &B,
        index: u32,
    ) -> Result<GroupRatchet, RatchetError> {
        if index < self.initial.counter() {
            return Err(RatchetError::UnknownMessageIndex {
                first_known: self.initial.counter(),
                requested: index,
            });
        }
        let mut ratchet = self.initial.clone();
        ratchet.advance_to(backend, index)?;
        Ok(ratchet)
    }

    /// Verify and decrypt a group message. The session itself never
    /// changes, so any index at or after the first known one can be
    /// decrypted any number of times.
    pub fn decrypt<B: RatchetBackend + ?Sized>(
        &self,
        backend: &B,
        message: &[u8],
    ) -> Result<GroupPlaintext, RatchetError> {
        if message.len() <= SIGNATURE_LEN {
            return Err(RatchetError::MalformedMessage);
        }
        let (body, signature) = message.split_at(message.len() - SIGNATURE_LEN);
        let signature = Ed25519Signature::from_slice(signature)?;
        backend
            .ed25519_verify(&self.signing_key, body, &signature)
            .map_err(|_| RatchetError::BadSignature)?;

        let decoded: GroupMessage = decode_versioned(body)?;
        let ratchet = self.ratchet_at(backend, decoded.message_index)?;
        let plaintext = ratchet
            .message_keys(backend)?
            .open(backend, &decoded.ciphertext, &[])?;

        Ok(GroupPlaintext {
            plaintext,
            message_index: decoded.message_index,
        })
    }
}

impl Pickle for InboundGroupSession {
    const KIND: u8 = 0x04;

    fn encode(&self) -> Zeroizing<Vec<u8>> {
        let mut buf = Zeroizing::new(Vec::with_capacity(1 + 4 + RATCHET_LEN + 33));
        buf.push(GROUP_PICKLE_VERSION);
        self.initial.write(&mut buf);
        buf.extend_from_slice(self.signing_key.as_bytes());
        buf.push(u8::from(self.signing_key_verified));
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self, RatchetError> {
        let mut reader = Reader::new(bytes);
        if reader.read_u8()? != GROUP_PICKLE_VERSION {
            return Err(RatchetError::DeserializationFailed);
        }
        let initial = GroupRatchet::read(&mut reader)?;
        let signing_key = Ed25519PublicKey::from(reader.read_array::<32>()?);
        let signing_key_verified = reader.read_bool()?;
        reader.finish()?;
        Ok(Self {
            initial,
            signing_key,
            signing_key_verified,
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::backend::{NativeBackend, PortableBackend, both};

    fn patterned() -> [u8; RATCHET_LEN] {
        let mut data = [0u8; RATCHET_LEN];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = i as u8;
        }
        data
    }

    #[test]
    fn test_advance_crosses_part_boundaries() {
        let backend = PortableBackend;
        let mut stepped = GroupRatchet::new(patterned(), 0xFF);
        stepped.advance(&backend).unwrap();
        assert_eq!(stepped.counter(), 0x100);

        let mut jumped = GroupRatchet::new(patterned(), 0xFF);
        jumped.advance_to(&backend, 0x100).unwrap();
        assert_eq!(jumped.as_bytes(), stepped.as_bytes());
        // R(0) and R(1) are untouched by a low-order carry.
        assert_eq!(stepped.as_bytes()[..64], patterned()[..64]);
    }

    #[test]
    fn test_advance_to_wraps_around() {
        let backend = PortableBackend;
        let mut ratchet = GroupRatchet::new(patterned(), u32::MAX);
        ratchet.advance_to(&backend, 1).unwrap();
        assert_eq!(ratchet.counter(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_advance_to_matches_repeated_advance(
            start in 0u32..0x0200_0000,
            steps in 0u32..600,
        ) {
            let backend = PortableBackend;
            let mut stepped = GroupRatchet::new(patterned(), start);
            for _ in 0..steps {
                stepped.advance(&backend).unwrap();
            }
            let mut jumped = GroupRatchet::new(patterned(), start);
            jumped.advance_to(&backend, start + steps).unwrap();

            prop_assert_eq!(jumped.counter(), stepped.counter());
            prop_assert_eq!(jumped.as_bytes(), stepped.as_bytes());
        }
    }

    #[test]
    fn test_encrypt_decrypt_out_of_order() {
        let backend = PortableBackend;
        let mut outbound = OutboundGroupSession::new(&backend).unwrap();
        let inbound =
            InboundGroupSession::from_session_key(&backend, &outbound.session_key(&backend).unwrap())
                .unwrap();
        assert!(inbound.is_verified());
        assert_eq!(inbound.session_id(), outbound.session_id());

        let messages: Vec<Vec<u8>> = (0..3)
            .map(|i| outbound.encrypt(&backend, format!("msg {i}").as_bytes()).unwrap())
            .collect();
        assert_eq!(outbound.message_index(), 3);

        for idx in [2usize, 0, 1, 2] {
            let decrypted = inbound.decrypt(&backend, &messages[idx]).unwrap();
            assert_eq!(decrypted.message_index, idx as u32);
            assert_eq!(decrypted.plaintext, format!("msg {idx}").into_bytes());
        }
    }

    #[test]
    fn test_peek_message_index() {
        let backend = PortableBackend;
        let mut outbound = OutboundGroupSession::new(&backend).unwrap();
        outbound.encrypt(&backend, b"zero").unwrap();
        let first = outbound.encrypt(&backend, b"one").unwrap();
        assert_eq!(peek_message_index(&first), Ok(1));
        assert_eq!(
            peek_message_index(&first[..10]),
            Err(RatchetError::MalformedMessage)
        );
    }

    #[test]
    fn test_late_joiner_cannot_read_history() {
        let backend = PortableBackend;
        let mut outbound = OutboundGroupSession::new(&backend).unwrap();
        let early = outbound.encrypt(&backend, b"before").unwrap();
        outbound.encrypt(&backend, b"also before").unwrap();

        let inbound =
            InboundGroupSession::from_session_key(&backend, &outbound.session_key(&backend).unwrap())
                .unwrap();
        assert_eq!(inbound.first_known_index(), 2);
        assert_eq!(
            inbound.decrypt(&backend, &early),
            Err(RatchetError::UnknownMessageIndex {
                first_known: 2,
                requested: 0
            })
        );
    }

    #[test]
    fn test_signatures_are_enforced() {
        let backend = PortableBackend;
        let mut outbound = OutboundGroupSession::new(&backend).unwrap();
        let session_key = outbound.session_key(&backend).unwrap();
        let inbound = InboundGroupSession::from_session_key(&backend, &session_key).unwrap();

        let mut message = outbound.encrypt(&backend, b"signed").unwrap();
        message[3] ^= 0x01;
        assert_eq!(
            inbound.decrypt(&backend, &message),
            Err(RatchetError::BadSignature)
        );

        let mut raw = STANDARD_NO_PAD.decode(&session_key).unwrap();
        raw[10] ^= 0x01;
        assert_eq!(
            InboundGroupSession::from_session_key(&backend, &STANDARD_NO_PAD.encode(raw)).err(),
            Some(RatchetError::BadSignature)
        );
    }

    #[test]
    fn test_backends_agree_on_ciphertext_and_session_key() {
        let [portable, native] = both();
        let outbound = OutboundGroupSession::new(&*portable).unwrap();

        assert_eq!(
            outbound.session_key(&*portable).unwrap(),
            outbound.session_key(&*native).unwrap()
        );

        let mut a = outbound.clone();
        let mut b = outbound;
        assert_eq!(
            a.encrypt(&*portable, b"same").unwrap(),
            b.encrypt(&*native, b"same").unwrap()
        );
    }

    #[test]
    fn test_export_import_is_unverified() {
        let backend = NativeBackend::new();
        let mut outbound = OutboundGroupSession::new(&backend).unwrap();
        let inbound =
            InboundGroupSession::from_session_key(&backend, &outbound.session_key(&backend).unwrap())
                .unwrap();
        outbound.encrypt(&backend, b"zero").unwrap();
        let one = outbound.encrypt(&backend, b"one").unwrap();

        let exported = inbound.export_at(&backend, 1).unwrap();
        let imported = InboundGroupSession::import(&exported);
        assert!(!imported.is_verified());
        assert_eq!(imported.first_known_index(), 1);
        assert_eq!(imported.decrypt(&backend, &one).unwrap().plaintext, b"one");
    }

    #[test]
    fn test_pickle_roundtrip_both_directions() {
        let backend = PortableBackend;
        let mut outbound = OutboundGroupSession::new(&backend).unwrap();
        outbound.encrypt(&backend, b"advance").unwrap();
        let inbound =
            InboundGroupSession::from_session_key(&backend, &outbound.session_key(&backend).unwrap())
                .unwrap();

        let mut restored_out = OutboundGroupSession::unpickle(
            &backend,
            &outbound.pickle(&backend, b"k").unwrap(),
            b"k",
        )
        .unwrap();
        assert_eq!(restored_out.message_index(), 1);
        let restored_in = InboundGroupSession::unpickle(
            &backend,
            &inbound.pickle(&backend, b"k").unwrap(),
            b"k",
        )
        .unwrap();
        assert!(restored_in.is_verified());

        let message = restored_out.encrypt(&backend, b"after").unwrap();
        assert_eq!(
            restored_in.decrypt(&backend, &message).unwrap().plaintext,
            b"after"
        );
    }
}
