use std::{collections::HashMap, marker::PhantomData};

use crypto::PublicKey;
use zeroize::{Zeroize, Zeroizing};

use crate::{
    aead::MessageKeys,
    backend::RatchetBackend,
    errors::RatchetError,
    hkdf::{HkdfInfo, PairwiseDomain, kdf_chain, kdf_root},
    keypair::InstallationKeyPair,
    reader::{Reader, write_option},
    types::{ChainKey, MessageKey, RootKey},
};

/// Current binary format version.
const SERIALIZATION_VERSION: u8 = 1;

/// Largest gap in one chain that a single message may open.
pub const MAX_SKIP: u32 = 1000;

/// Local state of the pairwise ratchet for one session.
///
/// Ratchet keys are rotated whenever the direction of the conversation
/// changes; within one direction the chain key is stepped with HMAC once per
/// message.
#[derive(Clone)]
pub struct RatchetState<D: HkdfInfo = PairwiseDomain> {
    pub root_key: RootKey,

    pub sending_chain: Option<ChainKey>,
    pub receiving_chain: Option<ChainKey>,

    pub dh_self: InstallationKeyPair,
    pub dh_remote: Option<PublicKey>,

    pub msg_send: u32,
    pub msg_recv: u32,
    pub prev_chain_len: u32,

    pub skipped_keys: HashMap<(PublicKey, u32), MessageKey>,

    pub(crate) _domain: PhantomData<D>,
}

impl<D: HkdfInfo> Drop for RatchetState<D> {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.sending_chain.zeroize();
        self.receiving_chain.zeroize();
        for key in self.skipped_keys.values_mut() {
            key.zeroize();
        }
    }
}

impl<D: HkdfInfo> RatchetState<D> {
    /// Serializes the ratchet state to a binary format.
    ///
    /// # Binary Format (Version 1)
    ///
    /// ```text
    /// | Field               | Size (bytes) | Description                          |
    /// |---------------------|--------------|--------------------------------------|
    /// | version             | 1            | Format version (0x01)                |
    /// | root_key            | 32           | Root key                             |
    /// | sending_chain_flag  | 1            | 0x00 = None, 0x01 = Some             |
    /// | sending_chain       | 0 or 32      | Chain key if flag is 0x01            |
    /// | receiving_chain_flag| 1            | 0x00 = None, 0x01 = Some             |
    /// | receiving_chain     | 0 or 32      | Chain key if flag is 0x01            |
    /// | dh_self_secret      | 32           | Ratchet secret key                   |
    /// | dh_remote_flag      | 1            | 0x00 = None, 0x01 = Some             |
    /// | dh_remote           | 0 or 32      | Remote ratchet key if flag is 0x01   |
    /// | msg_send            | 4            | Send counter (big-endian)            |
    /// | msg_recv            | 4            | Receive counter (big-endian)         |
    /// | prev_chain_len      | 4            | Previous chain length (big-endian)   |
    /// | skipped_count       | 4            | Number of skipped keys (big-endian)  |
    /// | skipped_keys        | 68 * count   | Each: pubkey(32) + msg_num(4) + key(32) |
    /// ```
    pub fn as_bytes(&self) -> Zeroizing<Vec<u8>> {
        let dh_remote = self.dh_remote.map(|pk| pk.to_bytes());
        let capacity = 1 + 32 + 33 * 3 + 32 + 12 + 4 + self.skipped_keys.len() * 68;
        let mut buf = Zeroizing::new(Vec::with_capacity(capacity));

        buf.push(SERIALIZATION_VERSION);
        buf.extend_from_slice(&self.root_key);
        write_option(&mut buf, self.sending_chain.as_ref());
        write_option(&mut buf, self.receiving_chain.as_ref());

        let mut dh_secret = self.dh_self.secret_bytes();
        buf.extend_from_slice(&dh_secret);
        dh_secret.zeroize();

        write_option(&mut buf, dh_remote.as_ref());

        buf.extend_from_slice(&self.msg_send.to_be_bytes());
        buf.extend_from_slice(&self.msg_recv.to_be_bytes());
        buf.extend_from_slice(&self.prev_chain_len.to_be_bytes());

        buf.extend_from_slice(&(self.skipped_keys.len() as u32).to_be_bytes());
        for ((pk, msg_num), mk) in &self.skipped_keys {
            buf.extend_from_slice(pk.as_bytes());
            buf.extend_from_slice(&msg_num.to_be_bytes());
            buf.extend_from_slice(mk);
        }

        buf
    }

    /// Deserializes a ratchet state from binary data.
    ///
    /// # Errors
    ///
    /// Returns `RatchetError::DeserializationFailed` if the data is invalid or truncated.
    pub fn from_bytes(data: &[u8]) -> Result<Self, RatchetError> {
        let mut reader = Reader::new(data);
        let state = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(state)
    }

    pub(crate) fn read(reader: &mut Reader<'_>) -> Result<Self, RatchetError> {
        let version = reader.read_u8()?;
        if version != SERIALIZATION_VERSION {
            return Err(RatchetError::DeserializationFailed);
        }

        let root_key: RootKey = reader.read_array()?;
        let sending_chain = reader.read_option()?;
        let receiving_chain = reader.read_option()?;

        let mut dh_self_bytes: [u8; 32] = reader.read_array()?;
        let dh_self = InstallationKeyPair::from_secret_bytes(dh_self_bytes);
        dh_self_bytes.zeroize();

        let dh_remote = reader.read_option()?.map(PublicKey::from);

        let msg_send = reader.read_u32()?;
        let msg_recv = reader.read_u32()?;
        let prev_chain_len = reader.read_u32()?;

        let skipped_count = reader.read_u32()? as usize;
        let mut skipped_keys = HashMap::new();
        for _ in 0..skipped_count {
            let pk = PublicKey::from(reader.read_array::<32>()?);
            let msg_num = reader.read_u32()?;
            let mk: MessageKey = reader.read_array()?;
            skipped_keys.insert((pk, msg_num), mk);
        }

        Ok(Self {
            root_key,
            sending_chain,
            receiving_chain,
            dh_self,
            dh_remote,
            msg_send,
            msg_recv,
            prev_chain_len,
            skipped_keys,
            _domain: PhantomData,
        })
    }
}

/// Public header attached to every encrypted message (unencrypted but authenticated).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub dh_pub: PublicKey,
    pub msg_num: u32,
    pub prev_chain_len: u32,
}

impl Header {
    /// Serializes the full header for use as Associated Authenticated Data (AAD).
    /// Format: DH public key (32 bytes) || message number (4 bytes, big-endian) || previous chain length (4 bytes, big-endian)
    pub fn serialized(&self) -> [u8; 40] {
        let mut aad = [0u8; 40];
        aad[0..32].copy_from_slice(self.dh_pub.as_bytes());
        aad[32..36].copy_from_slice(&self.msg_num.to_be_bytes());
        aad[36..40].copy_from_slice(&self.prev_chain_len.to_be_bytes());
        aad
    }

    /// Wire version byte followed by the serialized header.
    fn aad(&self) -> [u8; 41] {
        let mut aad = [0u8; 41];
        aad[0] = proto::WIRE_VERSION;
        aad[1..].copy_from_slice(&self.serialized());
        aad
    }
}

impl<D: HkdfInfo> RatchetState<D> {
    /// Initializes the session initiator.
    ///
    /// # Arguments
    ///
    /// * `root_key`      - Root key from the handshake.
    /// * `sending_chain` - First sending chain from the handshake.
    /// * `dh_self`       - Fresh ratchet keypair advertised with the first message.
    pub fn init_sender(root_key: RootKey, sending_chain: ChainKey, dh_self: InstallationKeyPair) -> Self {
        Self {
            root_key,

            sending_chain: Some(sending_chain),
            receiving_chain: None,

            dh_self,
            dh_remote: None,

            msg_send: 0,
            msg_recv: 0,
            prev_chain_len: 0,

            skipped_keys: HashMap::new(),

            _domain: PhantomData,
        }
    }

    /// Initializes the session responder from the first message's ratchet key.
    ///
    /// The receiving chain is the initiator's first sending chain. `dh_self`
    /// is replaced by a fresh keypair on the first send.
    pub fn init_receiver(
        root_key: RootKey,
        receiving_chain: ChainKey,
        remote_ratchet: PublicKey,
        dh_self: InstallationKeyPair,
    ) -> Self {
        Self {
            root_key,

            sending_chain: None,
            receiving_chain: Some(receiving_chain),

            dh_self,
            dh_remote: Some(remote_ratchet),

            msg_send: 0,
            msg_recv: 0,
            prev_chain_len: 0,

            skipped_keys: HashMap::new(),

            _domain: PhantomData,
        }
    }

    /// Performs a receiving-side DH ratchet when a new remote ratchet key is observed.
    fn dh_ratchet_receive<B: RatchetBackend + ?Sized>(
        &mut self,
        backend: &B,
        remote_pub: PublicKey,
    ) -> Result<(), RatchetError> {
        let dh_out = Zeroizing::new(self.dh_self.dh(&remote_pub));
        let (new_root, recv_chain) = kdf_root::<D, B>(backend, &self.root_key, &dh_out)?;

        self.root_key = new_root;
        self.receiving_chain = Some(recv_chain);
        self.sending_chain = None;
        self.dh_remote = Some(remote_pub);
        self.msg_recv = 0;
        Ok(())
    }

    /// Performs a sending-side DH ratchet: new keypair, new root, new sending chain.
    fn dh_ratchet_send<B: RatchetBackend + ?Sized>(&mut self, backend: &B) -> Result<(), RatchetError> {
        let remote = self.dh_remote.ok_or(RatchetError::MissingRemoteDhKey)?;

        self.dh_self = InstallationKeyPair::generate(backend)?;
        let dh_out = Zeroizing::new(self.dh_self.dh(&remote));
        let (new_root, send_chain) = kdf_root::<D, B>(backend, &self.root_key, &dh_out)?;

        self.root_key = new_root;
        self.sending_chain = Some(send_chain);
        self.prev_chain_len = self.msg_send;
        self.msg_send = 0;
        Ok(())
    }

    /// Encrypts a plaintext message.
    ///
    /// Performs a DH ratchet first if the conversation changed direction.
    ///
    /// # Returns
    ///
    /// The sealed ciphertext and the `Header` that must travel with it.
    pub fn encrypt_message<B: RatchetBackend + ?Sized>(
        &mut self,
        backend: &B,
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, Header), RatchetError> {
        if self.sending_chain.is_none() {
            self.dh_ratchet_send(backend)?;
        }

        let chain = self
            .sending_chain
            .as_mut()
            .ok_or(RatchetError::MissingSendingChain)?;
        let (next_chain, message_key) = kdf_chain::<D, B>(backend, chain)?;
        *chain = next_chain;

        let header = Header {
            dh_pub: *self.dh_self.public(),
            msg_num: self.msg_send,
            prev_chain_len: self.prev_chain_len,
        };
        self.msg_send += 1;

        let keys = MessageKeys::derive(backend, &Zeroizing::new(message_key)[..], D::MESSAGE_KEYS)?;
        let ciphertext = keys.seal(backend, plaintext, &header.aad())?;
        Ok((ciphertext, header))
    }

    /// Decrypts a received message.
    ///
    /// On error the state may be partially advanced; callers that need
    /// all-or-nothing semantics decrypt on a clone.
    pub fn decrypt_message<B: RatchetBackend + ?Sized>(
        &mut self,
        backend: &B,
        ciphertext: &[u8],
        header: &Header,
    ) -> Result<Vec<u8>, RatchetError> {
        let key_id = (header.dh_pub, header.msg_num);
        if let Some(msg_key) = self.skipped_keys.remove(&key_id) {
            return Self::open(backend, Zeroizing::new(msg_key), ciphertext, header);
        }

        if self.dh_remote.as_ref() == Some(&header.dh_pub) && header.msg_num < self.msg_recv {
            return Err(RatchetError::MessageReplay);
        }

        if self.dh_remote.as_ref() != Some(&header.dh_pub) {
            if self.receiving_chain.is_some() {
                self.skip_message_keys(backend, header.prev_chain_len)?;
            }
            self.dh_ratchet_receive(backend, header.dh_pub)?;
        }

        self.skip_message_keys(backend, header.msg_num)?;

        let chain = self
            .receiving_chain
            .as_mut()
            .ok_or(RatchetError::MissingReceivingChain)?;
        let (next_chain, message_key) = kdf_chain::<D, B>(backend, chain)?;
        *chain = next_chain;
        self.msg_recv += 1;

        Self::open(backend, Zeroizing::new(message_key), ciphertext, header)
    }

    fn open<B: RatchetBackend + ?Sized>(
        backend: &B,
        message_key: Zeroizing<MessageKey>,
        ciphertext: &[u8],
        header: &Header,
    ) -> Result<Vec<u8>, RatchetError> {
        let keys = MessageKeys::derive(backend, &message_key[..], D::MESSAGE_KEYS)?;
        keys.open(backend, ciphertext, &header.aad())
    }

    /// Advances the receiving chain up to `until` (exclusive), storing the
    /// skipped message keys.
    pub fn skip_message_keys<B: RatchetBackend + ?Sized>(
        &mut self,
        backend: &B,
        until: u32,
    ) -> Result<(), RatchetError> {
        if self.msg_recv.saturating_add(MAX_SKIP) < until {
            return Err(RatchetError::TooManySkippedMessages);
        }

        while self.msg_recv < until {
            let chain = self
                .receiving_chain
                .as_mut()
                .ok_or(RatchetError::MissingReceivingChain)?;
            let (next_chain, msg_key) = kdf_chain::<D, B>(backend, chain)?;
            *chain = next_chain;

            let remote = self.dh_remote.ok_or(RatchetError::MissingRemoteDhKey)?;
            self.skipped_keys.insert((remote, self.msg_recv), msg_key);
            self.msg_recv += 1;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::backend::{PortableBackend, both};

    fn setup_alice_bob(backend: &dyn RatchetBackend) -> (RatchetState, RatchetState) {
        let root = [0x42; 32];
        let chain = [0x24; 32];

        let alice_ratchet = InstallationKeyPair::generate(backend).unwrap();
        let alice_pub = *alice_ratchet.public();
        let alice = RatchetState::init_sender(root, chain, alice_ratchet);

        let bob_placeholder = InstallationKeyPair::generate(backend).unwrap();
        let bob = RatchetState::init_receiver(root, chain, alice_pub, bob_placeholder);

        (alice, bob)
    }

    #[test]
    fn test_basic_roundtrip_one_message() {
        let backend = &PortableBackend;
        let (mut alice, mut bob) = setup_alice_bob(backend);

        let plaintext = b"Hello Bob, this is Alice!";
        let (ct, header) = alice.encrypt_message(backend, plaintext).unwrap();
        let decrypted = bob.decrypt_message(backend, &ct, &header).unwrap();

        assert_eq!(decrypted, plaintext);
        assert_eq!(alice.msg_send, 1);
        assert_eq!(bob.msg_recv, 1);
    }

    #[test]
    fn test_out_of_order_messages_with_skipped_keys() {
        let backend = &PortableBackend;
        let (mut alice, mut bob) = setup_alice_bob(backend);

        let mut sent = vec![];
        for i in 0..3 {
            let plaintext = format!("Message {}", i + 1).into_bytes();
            let (ct, header) = alice.encrypt_message(backend, &plaintext).unwrap();
            sent.push((ct, header, plaintext));
        }

        for idx in [0, 2, 1] {
            let (ct, header, plaintext) = &sent[idx];
            assert_eq!(&bob.decrypt_message(backend, ct, header).unwrap(), plaintext);
        }
        assert_eq!(bob.msg_recv, 3);
        assert!(bob.skipped_keys.is_empty());
    }

    #[test]
    fn test_full_asymmetric_ratchet_conversation() {
        let backend = &PortableBackend;
        let (mut alice, mut bob) = setup_alice_bob(backend);

        for i in 0..3 {
            let msg = format!("A -> B {}", i).into_bytes();
            let (ct, h) = alice.encrypt_message(backend, &msg).unwrap();
            assert_eq!(bob.decrypt_message(backend, &ct, &h).unwrap(), msg);
        }

        let bob_initial = *bob.dh_self.public();
        let (ct_b, h_b) = bob.encrypt_message(backend, b"B -> A response").unwrap();
        assert_ne!(h_b.dh_pub, bob_initial);
        assert_eq!(h_b.prev_chain_len, 0);
        assert_eq!(
            alice.decrypt_message(backend, &ct_b, &h_b).unwrap(),
            b"B -> A response"
        );

        let old_alice_pub = *alice.dh_self.public();
        let (ct_a, h_a) = alice.encrypt_message(backend, b"after both ratcheted").unwrap();
        assert_ne!(h_a.dh_pub, old_alice_pub);
        assert_eq!(h_a.prev_chain_len, 3);
        assert_eq!(
            bob.decrypt_message(backend, &ct_a, &h_a).unwrap(),
            b"after both ratcheted"
        );
    }

    #[test]
    fn test_skipped_keys_from_previous_chain() {
        let backend = &PortableBackend;
        let (mut alice, mut bob) = setup_alice_bob(backend);

        let (ct0, h0) = alice.encrypt_message(backend, b"zero").unwrap();
        let (ct1, h1) = alice.encrypt_message(backend, b"one").unwrap();
        bob.decrypt_message(backend, &ct0, &h0).unwrap();

        let (ct_b, h_b) = bob.encrypt_message(backend, b"reply").unwrap();
        alice.decrypt_message(backend, &ct_b, &h_b).unwrap();
        let (ct2, h2) = alice.encrypt_message(backend, b"two").unwrap();

        // New chain arrives first; "one" is still recoverable from the old chain.
        assert_eq!(bob.decrypt_message(backend, &ct2, &h2).unwrap(), b"two");
        assert_eq!(bob.decrypt_message(backend, &ct1, &h1).unwrap(), b"one");
    }

    #[test]
    fn test_max_skip_limit_enforced() {
        let backend = &PortableBackend;
        let (mut alice, mut bob) = setup_alice_bob(backend);

        for _ in 0..=MAX_SKIP {
            alice.encrypt_message(backend, b"lost").unwrap();
        }
        let (ct_final, header_final) = alice.encrypt_message(backend, b"Final").unwrap();

        assert_eq!(
            bob.decrypt_message(backend, &ct_final, &header_final),
            Err(RatchetError::TooManySkippedMessages)
        );
    }

    #[test]
    fn test_aad_authenticates_header() {
        let backend = &PortableBackend;
        let (mut alice, mut bob) = setup_alice_bob(backend);

        let (ct, mut header) = alice.encrypt_message(backend, b"Sensitive data").unwrap();
        header.prev_chain_len = 7;

        assert_eq!(
            bob.decrypt_message(backend, &ct, &header),
            Err(RatchetError::DecryptionFailed)
        );
    }

    #[test]
    fn test_replay_rejected() {
        let backend = &PortableBackend;
        let (mut alice, mut bob) = setup_alice_bob(backend);

        let (ct, h) = alice.encrypt_message(backend, b"once").unwrap();
        bob.decrypt_message(backend, &ct, &h).unwrap();
        assert_eq!(
            bob.decrypt_message(backend, &ct, &h),
            Err(RatchetError::MessageReplay)
        );
    }

    #[test]
    fn test_backends_produce_identical_ciphertext() {
        let [portable, native] = both();
        let (alice, _) = setup_alice_bob(&*portable);

        let mut a = alice.clone();
        let mut b = alice;
        let (ct_a, h_a) = a.encrypt_message(&*portable, b"same bytes").unwrap();
        let (ct_b, h_b) = b.encrypt_message(&*native, b"same bytes").unwrap();

        assert_eq!(ct_a, ct_b);
        assert_eq!(h_a, h_b);
    }

    #[test]
    fn test_serialize_deserialize_continue_conversation() {
        let backend = &PortableBackend;
        let (mut alice, mut bob) = setup_alice_bob(backend);

        let (ct1, h1) = alice.encrypt_message(backend, b"Hello Bob").unwrap();
        let (ct_skipped, h_skipped) = alice.encrypt_message(backend, b"late").unwrap();
        let (ct3, h3) = alice.encrypt_message(backend, b"third").unwrap();
        bob.decrypt_message(backend, &ct1, &h1).unwrap();
        bob.decrypt_message(backend, &ct3, &h3).unwrap();

        let mut bob_restored: RatchetState = RatchetState::from_bytes(&bob.as_bytes()).unwrap();
        assert_eq!(bob_restored.skipped_keys.len(), 1);
        assert_eq!(
            bob_restored
                .decrypt_message(backend, &ct_skipped, &h_skipped)
                .unwrap(),
            b"late"
        );

        let mut alice_restored: RatchetState = RatchetState::from_bytes(&alice.as_bytes()).unwrap();
        let (ct4, h4) = bob_restored.encrypt_message(backend, b"Reply after restore").unwrap();
        assert_eq!(
            alice_restored.decrypt_message(backend, &ct4, &h4).unwrap(),
            b"Reply after restore"
        );
    }

    #[test]
    fn test_serialization_rejects_bad_input() {
        let backend = &PortableBackend;
        let (alice, _) = setup_alice_bob(backend);
        let mut bytes = alice.as_bytes();

        assert!(RatchetState::<PairwiseDomain>::from_bytes(&bytes[..10]).is_err());

        bytes[0] = 0xFF;
        assert!(matches!(
            RatchetState::<PairwiseDomain>::from_bytes(&bytes),
            Err(RatchetError::DeserializationFailed)
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_send_counters_are_monotonic(count in 1usize..40, turns in 1usize..4) {
            let backend = &PortableBackend;
            let (mut alice, mut bob) = setup_alice_bob(backend);

            for turn in 0..turns {
                let (sender, receiver) = if turn % 2 == 0 {
                    (&mut alice, &mut bob)
                } else {
                    (&mut bob, &mut alice)
                };
                let mut last: Option<u32> = None;
                for _ in 0..count {
                    let (ct, h) = sender.encrypt_message(backend, b"m").unwrap();
                    if let Some(prev) = last {
                        prop_assert_eq!(h.msg_num, prev + 1);
                    } else {
                        prop_assert_eq!(h.msg_num, 0);
                    }
                    last = Some(h.msg_num);
                    prop_assert_eq!(receiver.decrypt_message(backend, &ct, &h).unwrap(), b"m".to_vec());
                    prop_assert_eq!(
                        receiver.decrypt_message(backend, &ct, &h),
                        Err(RatchetError::MessageReplay)
                    );
                }
            }
        }
    }
}
