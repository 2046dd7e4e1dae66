use base64::{Engine, engine::general_purpose::STANDARD_NO_PAD};
use crypto::{PublicKey, TripleDh};
use proto::{PairwiseMessage, PreKeyMessage, decode_versioned, encode_versioned};
use zeroize::Zeroizing;

use crate::{
    account::Account,
    backend::RatchetBackend,
    errors::RatchetError,
    hkdf::{PairwiseDomain, kdf_handshake},
    keypair::InstallationKeyPair,
    pickle::Pickle,
    reader::{Reader, write_prefixed},
    state::{Header, RatchetState},
};

const SESSION_PICKLE_VERSION: u8 = 1;

/// Which envelope a pairwise ciphertext travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Carries the handshake keys so the recipient can create the session.
    PreKey,
    Normal,
}

impl MessageKind {
    pub fn as_u8(self) -> u8 {
        match self {
            MessageKind::PreKey => 0,
            MessageKind::Normal => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageKind::PreKey),
            1 => Some(MessageKind::Normal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairwiseCiphertext {
    pub kind: MessageKind,
    pub body: Vec<u8>,
}

/// Handshake keys repeated on every message until the peer answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingPreKey {
    one_time_key: PublicKey,
    base_key: PublicKey,
    identity_key: PublicKey,
}

/// One double-ratchet channel between two devices.
#[derive(Clone)]
pub struct PairwiseSession {
    session_id: String,
    ratchet: RatchetState<PairwiseDomain>,
    pending_prekey: Option<PendingPreKey>,
    received_message: bool,
}

/// `base64(SHA-256(I_a ‖ E_a ‖ O_b))`, identical on both ends of the session.
fn session_id<B: RatchetBackend + ?Sized>(
    backend: &B,
    identity_key: &PublicKey,
    base_key: &PublicKey,
    one_time_key: &PublicKey,
) -> String {
    let mut material = [0u8; 96];
    material[..32].copy_from_slice(identity_key.as_bytes());
    material[32..64].copy_from_slice(base_key.as_bytes());
    material[64..].copy_from_slice(one_time_key.as_bytes());
    STANDARD_NO_PAD.encode(backend.sha256(&material))
}

fn header_of(message: &PairwiseMessage) -> Result<Header, RatchetError> {
    Ok(Header {
        dh_pub: PublicKey::from_slice(&message.ratchet_key)?,
        msg_num: message.counter,
        prev_chain_len: message.previous_counter,
    })
}

impl PairwiseSession {
    /// Start a session as the initiator.
    pub fn outbound<B: RatchetBackend + ?Sized>(
        backend: &B,
        account: &Account,
        remote_identity_key: PublicKey,
        remote_one_time_key: PublicKey,
    ) -> Result<Self, RatchetError> {
        let base = InstallationKeyPair::generate(backend)?;
        let secret = TripleDh::initiator(
            account.identity().secret(),
            base.secret(),
            &remote_identity_key,
            &remote_one_time_key,
        );
        let (root, chain) = kdf_handshake::<PairwiseDomain, B>(backend, &secret)?;
        let ratchet = RatchetState::init_sender(root, chain, InstallationKeyPair::generate(backend)?);

        let identity_key = account.identity_key();
        Ok(Self {
            session_id: session_id(backend, &identity_key, base.public(), &remote_one_time_key),
            ratchet,
            pending_prekey: Some(PendingPreKey {
                one_time_key: remote_one_time_key,
                base_key: *base.public(),
                identity_key,
            }),
            received_message: false,
        })
    }

    /// Create a session from a received pre-key message and decrypt it.
    ///
    /// The referenced one-time key is removed from `account` only once the
    /// embedded message has decrypted.
    pub fn inbound<B: RatchetBackend + ?Sized>(
        backend: &B,
        account: &mut Account,
        prekey_message: &[u8],
    ) -> Result<(Self, Vec<u8>), RatchetError> {
        let outer: PreKeyMessage = decode_versioned(prekey_message)?;
        let one_time_key = PublicKey::from_slice(&outer.one_time_key)?;
        let base_key = PublicKey::from_slice(&outer.base_key)?;
        let identity_key = PublicKey::from_slice(&outer.identity_key)?;
        let inner: PairwiseMessage = decode_versioned(&outer.message)?;
        let header = header_of(&inner)?;

        let one_time = account
            .one_time_key(&one_time_key)
            .ok_or(RatchetError::UnknownOneTimeKey)?;
        let secret = TripleDh::responder(
            account.identity().secret(),
            one_time.secret(),
            &identity_key,
            &base_key,
        );
        let (root, chain) = kdf_handshake::<PairwiseDomain, B>(backend, &secret)?;
        let ratchet = RatchetState::init_receiver(
            root,
            chain,
            header.dh_pub,
            InstallationKeyPair::generate(backend)?,
        );

        let mut session = Self {
            session_id: session_id(backend, &identity_key, &base_key, &one_time_key),
            ratchet,
            pending_prekey: None,
            received_message: false,
        };
        let plaintext = session.decrypt_inner(backend, &inner, &header)?;
        account.remove_one_time_key(&one_time_key);
        Ok((session, plaintext))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// True once this side has decrypted anything from its peer.
    pub fn has_received_message(&self) -> bool {
        self.received_message
    }

    /// Whether `prekey_message` was produced by the session on the other end
    /// of this one.
    pub fn matches_inbound<B: RatchetBackend + ?Sized>(
        &self,
        backend: &B,
        prekey_message: &[u8],
    ) -> Result<bool, RatchetError> {
        let outer: PreKeyMessage = decode_versioned(prekey_message)?;
        let id = session_id(
            backend,
            &PublicKey::from_slice(&outer.identity_key)?,
            &PublicKey::from_slice(&outer.base_key)?,
            &PublicKey::from_slice(&outer.one_time_key)?,
        );
        Ok(id == self.session_id)
    }

    pub fn encrypt<B: RatchetBackend + ?Sized>(
        &mut self,
        backend: &B,
        plaintext: &[u8],
    ) -> Result<PairwiseCiphertext, RatchetError> {
        let (ciphertext, header) = self.ratchet.encrypt_message(backend, plaintext)?;
        let body = encode_versioned(&PairwiseMessage {
            ratchet_key: header.dh_pub.to_bytes().to_vec(),
            counter: header.msg_num,
            previous_counter: header.prev_chain_len,
            ciphertext,
        });

        match &self.pending_prekey {
            Some(pending) if !self.received_message => Ok(PairwiseCiphertext {
                kind: MessageKind::PreKey,
                body: encode_versioned(&PreKeyMessage {
                    one_time_key: pending.one_time_key.to_bytes().to_vec(),
                    base_key: pending.base_key.to_bytes().to_vec(),
                    identity_key: pending.identity_key.to_bytes().to_vec(),
                    message: body,
                }),
            }),
            _ => Ok(PairwiseCiphertext {
                kind: MessageKind::Normal,
                body,
            }),
        }
    }

    /// Decrypt a message on this session. The ratchet is left untouched if
    /// decryption fails.
    pub fn decrypt<B: RatchetBackend + ?Sized>(
        &mut self,
        backend: &B,
        message: &PairwiseCiphertext,
    ) -> Result<Vec<u8>, RatchetError> {
        let inner: PairwiseMessage = match message.kind {
            MessageKind::PreKey => {
                if !self.matches_inbound(backend, &message.body)? {
                    return Err(RatchetError::SessionMismatch);
                }
                let outer: PreKeyMessage = decode_versioned(&message.body)?;
                decode_versioned(&outer.message)?
            }
            MessageKind::Normal => decode_versioned(&message.body)?,
        };
        let header = header_of(&inner)?;
        self.decrypt_inner(backend, &inner, &header)
    }

    fn decrypt_inner<B: RatchetBackend + ?Sized>(
        &mut self,
        backend: &B,
        inner: &PairwiseMessage,
        header: &Header,
    ) -> Result<Vec<u8>, RatchetError> {
        let backup = self.ratchet.clone();
        match self
            .ratchet
            .decrypt_message(backend, &inner.ciphertext, header)
        {
            Ok(plaintext) => {
                self.received_message = true;
                self.pending_prekey = None;
                Ok(plaintext)
            }
            Err(err) => {
                self.ratchet = backup;
                Err(err)
            }
        }
    }
}

impl Pickle for PairwiseSession {
    const KIND: u8 = 0x02;

    fn encode(&self) -> Zeroizing<Vec<u8>> {
        let mut buf = Zeroizing::new(Vec::new());
        buf.push(SESSION_PICKLE_VERSION);
        write_prefixed(&mut buf, self.session_id.as_bytes());
        buf.push(u8::from(self.received_message));
        match &self.pending_prekey {
            Some(pending) => {
                buf.push(0x01);
                buf.extend_from_slice(pending.one_time_key.as_bytes());
                buf.extend_from_slice(pending.base_key.as_bytes());
                buf.extend_from_slice(pending.identity_key.as_bytes());
            }
            None => buf.push(0x00),
        }
        buf.extend_from_slice(&self.ratchet.as_bytes());
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self, RatchetError> {
        let mut reader = Reader::new(bytes);
        if reader.read_u8()? != SESSION_PICKLE_VERSION {
            return Err(RatchetError::DeserializationFailed);
        }
        let session_id = String::from_utf8(reader.read_prefixed()?.to_vec())
            .map_err(|_| RatchetError::DeserializationFailed)?;
        let received_message = reader.read_bool()?;
        let pending_prekey = if reader.read_bool()? {
            Some(PendingPreKey {
                one_time_key: PublicKey::from(reader.read_array::<32>()?),
                base_key: PublicKey::from(reader.read_array::<32>()?),
                identity_key: PublicKey::from(reader.read_array::<32>()?),
            })
        } else {
            None
        };
        let ratchet = RatchetState::read(&mut reader)?;
        reader.finish()?;

        Ok(Self {
            session_id,
            ratchet,
            pending_prekey,
            received_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{NativeBackend, PortableBackend};

    struct Devices {
        alice: Account,
        bob: Account,
    }

    fn devices(backend: &dyn RatchetBackend) -> Devices {
        let alice = backend.generate_identity().unwrap();
        let mut bob = backend.generate_identity().unwrap();
        bob.generate_one_time_keys(backend, 2).unwrap();
        Devices { alice, bob }
    }

    fn open_pair(backend: &dyn RatchetBackend) -> (Devices, PairwiseSession, PairwiseSession) {
        let mut devices = devices(backend);
        let otk = devices.bob.one_time_keys()[0];
        let mut outbound = backend
            .create_outbound_session(&devices.alice, devices.bob.identity_key(), otk)
            .unwrap();
        let first = outbound.encrypt(backend, b"hello").unwrap();
        assert_eq!(first.kind, MessageKind::PreKey);

        let (inbound, plaintext) = backend
            .create_inbound_session(&mut devices.bob, &first.body)
            .unwrap();
        assert_eq!(plaintext, b"hello");
        (devices, outbound, inbound)
    }

    #[test]
    fn test_hello_world_on_same_session() {
        let backend = PortableBackend;
        let (_, mut alice, mut bob) = open_pair(&backend);

        assert_eq!(alice.session_id(), bob.session_id());

        let second = alice.encrypt(&backend, b"world").unwrap();
        assert_eq!(second.kind, MessageKind::PreKey);
        assert!(bob.matches_inbound(&backend, &second.body).unwrap());
        assert_eq!(bob.decrypt(&backend, &second).unwrap(), b"world");

        let reply = bob.encrypt(&backend, b"hi alice").unwrap();
        assert_eq!(reply.kind, MessageKind::Normal);
        assert_eq!(alice.decrypt(&backend, &reply).unwrap(), b"hi alice");

        let after = alice.encrypt(&backend, b"no more prekeys").unwrap();
        assert_eq!(after.kind, MessageKind::Normal);
        assert_eq!(bob.decrypt(&backend, &after).unwrap(), b"no more prekeys");
    }

    #[test]
    fn test_one_time_key_consumed_only_on_success() {
        let backend = NativeBackend::new();
        let mut devices = devices(&backend);
        let otk = devices.bob.one_time_keys()[0];
        let mut alice = backend
            .create_outbound_session(&devices.alice, devices.bob.identity_key(), otk)
            .unwrap();
        let mut first = alice.encrypt(&backend, b"hello").unwrap();

        let last = first.body.len() - 1;
        first.body[last] ^= 0x01;
        assert!(
            backend
                .create_inbound_session(&mut devices.bob, &first.body)
                .is_err()
        );
        assert_eq!(devices.bob.one_time_keys().len(), 2);

        first.body[last] ^= 0x01;
        backend
            .create_inbound_session(&mut devices.bob, &first.body)
            .unwrap();
        assert_eq!(devices.bob.one_time_keys().len(), 1);
        assert_eq!(
            backend
                .create_inbound_session(&mut devices.bob, &first.body)
                .err(),
            Some(RatchetError::UnknownOneTimeKey)
        );
    }

    #[test]
    fn test_failed_decrypt_rolls_back() {
        let backend = PortableBackend;
        let (_, mut alice, mut bob) = open_pair(&backend);

        let good = alice.encrypt(&backend, b"good").unwrap();
        let mut bad = good.clone();
        let last = bad.body.len() - 1;
        bad.body[last] ^= 0xFF;

        let before = bob.ratchet.as_bytes();
        assert!(bob.decrypt(&backend, &bad).is_err());
        assert_eq!(bob.ratchet.as_bytes(), before);
        assert_eq!(bob.decrypt(&backend, &good).unwrap(), b"good");
    }

    #[test]
    fn test_prekey_for_other_session_rejected() {
        let backend = PortableBackend;
        let (mut devices, _, mut bob) = open_pair(&backend);

        let otk = devices.bob.one_time_keys()[0];
        let mut other = backend
            .create_outbound_session(&devices.alice, devices.bob.identity_key(), otk)
            .unwrap();
        let msg = other.encrypt(&backend, b"other").unwrap();

        assert!(!bob.matches_inbound(&backend, &msg.body).unwrap());
        assert_eq!(
            bob.decrypt(&backend, &msg),
            Err(RatchetError::SessionMismatch)
        );
        let (fresh, plaintext) = backend
            .create_inbound_session(&mut devices.bob, &msg.body)
            .unwrap();
        assert_eq!(plaintext, b"other");
        assert_ne!(fresh.session_id(), bob.session_id());
    }

    #[test]
    fn test_pickle_roundtrip_keeps_conversation() {
        let backend = PortableBackend;
        let (_, mut alice, bob) = open_pair(&backend);

        let pickled = bob.pickle(&backend, b"secret").unwrap();
        let mut restored = PairwiseSession::unpickle(&backend, &pickled, b"secret").unwrap();
        assert_eq!(restored.session_id(), bob.session_id());

        let msg = alice.encrypt(&backend, b"after restore").unwrap();
        assert_eq!(restored.decrypt(&backend, &msg).unwrap(), b"after restore");
    }

    #[test]
    fn test_message_kind_codes() {
        assert_eq!(MessageKind::from_u8(MessageKind::PreKey.as_u8()), Some(MessageKind::PreKey));
        assert_eq!(MessageKind::from_u8(1), Some(MessageKind::Normal));
        assert_eq!(MessageKind::from_u8(2), None);
    }
}
