//! Encrypt/decrypt orchestration over the session store.

use std::sync::{Arc, Mutex, MutexGuard};

use crypto::{Ed25519PublicKey, Ed25519Signature, PublicKey};
use dashmap::DashMap;
use double_ratchets::{
    Account, InboundGroupSession, MessageKind, OutboundGroupSession, PairwiseCiphertext,
    RatchetBackend, RatchetError, backend, peek_message_index,
};
use proto::{PreKeyMessage, decode_versioned};
use session_store::{
    DeviceSession, GroupSessionState, InboundGroupSessionRecord, OutboundGroupSessionRecord,
    ReplayGuard, SessionStore, timestamp_millis,
};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::{
    compat,
    config::{EngineConfig, GroupSessionPolicy},
    cross_signing::{
        CrossSigningKey, CrossSigningKeys, CrossSigningUpload, USAGE_MASTER, USAGE_SELF_SIGNING,
        USAGE_USER_SIGNING,
    },
    errors::EngineError,
    retry::RetryQueue,
    sync::{
        BatchOutcome, DecryptedRoomEvent, EncryptedGroupMessage, EncryptedRoomEvent,
        MEGOLM_ALGORITHM, RoomKeyContent, ToDeviceEvent, ToDeviceMessage, ToDevicePayload,
    },
};

/// A remote device as reported by the device directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDevice {
    pub user_id: String,
    pub device_id: String,
    pub identity_key: PublicKey,
    /// A claimed one-time key. Only needed when no session exists yet.
    pub one_time_key: Option<PublicKey>,
}

/// Result of [`SessionEngine::prune`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub message_hashes: usize,
    pub redacted_sessions: Vec<String>,
}

/// The device's encryption engine.
///
/// Pairwise work for one remote device is serialized by the store's
/// per-device lock; outbound group work for one room by a per-room lock;
/// writes to one inbound group session row by the store's per-session lock.
/// Everything else runs concurrently.
pub struct SessionEngine {
    user_id: String,
    device_id: String,
    backend: &'static dyn RatchetBackend,
    store: SessionStore,
    replay: ReplayGuard,
    retry: RetryQueue,
    account: Mutex<Account>,
    identity_key: PublicKey,
    signing_key: Ed25519PublicKey,
    policy: GroupSessionPolicy,
    message_hash_retention_ms: i64,
    room_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionEngine {
    /// Install the configured backend process-wide and open the engine on it.
    pub fn open(config: &EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let backend = backend::install(config.backend)?;
        Self::open_with_backend(config, backend)
    }

    /// Open the engine on an explicit backend, which must be of the
    /// configured kind.
    pub fn open_with_backend(
        config: &EngineConfig,
        backend: &'static dyn RatchetBackend,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        if backend.kind() != config.backend {
            return Err(RatchetError::BackendMismatch {
                active: backend.kind(),
                requested: config.backend,
            }
            .into());
        }

        let store = SessionStore::new(
            &config.storage,
            &config.account_id,
            config.pickle_key.as_bytes(),
            backend,
        )?;
        let account = match store.get_account()? {
            Some(account) => {
                debug!(account_id = %config.account_id, "loaded account");
                account
            }
            None => {
                let account = backend.generate_identity()?;
                store.put_account(&account)?;
                info!(
                    account_id = %config.account_id,
                    identity_key = %account.identity_key(),
                    "generated device account"
                );
                account
            }
        };
        let replay = ReplayGuard::new(store.db());

        Ok(Self {
            user_id: config.user_id.clone(),
            device_id: config.device_id.clone(),
            backend,
            identity_key: account.identity_key(),
            signing_key: account.signing_key(),
            account: Mutex::new(account),
            store,
            replay,
            retry: RetryQueue::new(),
            policy: config.group_session,
            message_hash_retention_ms: config.message_hash_retention_ms,
            room_locks: DashMap::new(),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn identity_key(&self) -> PublicKey {
        self.identity_key
    }

    pub fn signing_key(&self) -> Ed25519PublicKey {
        self.signing_key
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    fn account(&self) -> Result<MutexGuard<'_, Account>, EngineError> {
        self.account.lock().map_err(|_| EngineError::LockPoisoned)
    }

    fn with_room<T, F>(&self, room_id: &str, f: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Result<T, EngineError>,
    {
        let lock = Arc::clone(self.room_locks.entry(room_id.to_string()).or_default().value());
        let _guard = lock.lock().map_err(|_| EngineError::LockPoisoned)?;
        f()
    }

    /// Sign `message` with the device's ed25519 key.
    pub fn sign(&self, message: &[u8]) -> Result<Ed25519Signature, EngineError> {
        Ok(self.account()?.sign(self.backend, message)?)
    }

    /// Create `count` one-time keys for publication and persist the account.
    pub fn generate_one_time_keys(&self, count: usize) -> Result<Vec<PublicKey>, EngineError> {
        let mut account = self.account()?;
        let keys = account.generate_one_time_keys(self.backend, count)?;
        self.store.put_account(&account)?;
        debug!(count, "generated one-time keys");
        Ok(keys)
    }

    // ==================== Pairwise ====================

    /// Encrypt for `device` on its latest session, opening one from the
    /// claimed one-time key if none exists.
    pub fn encrypt_pairwise(
        &self,
        device: &RemoteDevice,
        plaintext: &[u8],
    ) -> Result<PairwiseCiphertext, EngineError> {
        let sender_key = device.identity_key;
        self.store.with_device(&sender_key, || -> Result<_, EngineError> {
            let now = timestamp_millis();
            if let Some(mut session) = self.store.get_latest_session(&sender_key)? {
                let ciphertext = session.session.encrypt(self.backend, plaintext)?;
                session.last_encrypted = now;
                self.store.update_session(&sender_key, &session)?;
                return Ok(ciphertext);
            }

            let Some(one_time_key) = device.one_time_key else {
                return Err(EngineError::NoSessionFound {
                    sender_key: sender_key.to_base64(),
                });
            };
            let created = {
                let account = self.account()?;
                self.backend
                    .create_outbound_session(&account, sender_key, one_time_key)?
            };
            let mut session = DeviceSession::new(created, now);
            let ciphertext = session.session.encrypt(self.backend, plaintext)?;
            self.store.add_session(&sender_key, &session)?;
            debug!(
                session_id = session.session_id(),
                user_id = %device.user_id,
                device_id = %device.device_id,
                "created outbound pairwise session"
            );
            Ok(ciphertext)
        })
    }

    /// Decrypt a pairwise message from `sender_key`.
    pub fn decrypt_pairwise(
        &self,
        sender_key: &PublicKey,
        message: &PairwiseCiphertext,
    ) -> Result<Vec<u8>, EngineError> {
        self.store.with_device(sender_key, || -> Result<_, EngineError> {
            let hash = self.message_hash(message);
            if let Some(received_at) = self.store.get_message_hash(&hash)? {
                warn!(sender_key = %sender_key, received_at, "rejecting duplicate pairwise message");
                return Err(EngineError::DuplicateMessage);
            }

            let plaintext = match message.kind {
                MessageKind::PreKey => self.decrypt_prekey(sender_key, message)?,
                MessageKind::Normal => self.decrypt_normal(sender_key, message)?,
            };
            self.store.put_message_hash(&hash, timestamp_millis())?;
            Ok(plaintext)
        })
    }

    fn message_hash(&self, message: &PairwiseCiphertext) -> [u8; 32] {
        let mut data = Vec::with_capacity(1 + message.body.len());
        data.push(message.kind.as_u8());
        data.extend_from_slice(&message.body);
        self.backend.sha256(&data)
    }

    fn decrypt_prekey(
        &self,
        sender_key: &PublicKey,
        message: &PairwiseCiphertext,
    ) -> Result<Vec<u8>, EngineError> {
        for mut session in self.store.get_sessions(sender_key)? {
            if session.session.matches_inbound(self.backend, &message.body)? {
                let plaintext = session.session.decrypt(self.backend, message)?;
                session.last_decrypted = timestamp_millis();
                self.store.update_session(sender_key, &session)?;
                return Ok(plaintext);
            }
        }

        let outer: PreKeyMessage = decode_versioned(&message.body).map_err(RatchetError::from)?;
        let claimed = PublicKey::from_slice(&outer.identity_key).map_err(RatchetError::from)?;
        if claimed != *sender_key {
            return Err(EngineError::SenderKeyMismatch {
                expected: sender_key.to_base64(),
                actual: claimed.to_base64(),
            });
        }

        let mut account = self.account()?;
        let (created, plaintext) = self
            .backend
            .create_inbound_session(&mut account, &message.body)?;
        let session = DeviceSession::new(created, timestamp_millis());
        self.store.add_session(sender_key, &session)?;
        self.store.put_account(&account)?;
        debug!(
            session_id = session.session_id(),
            sender_key = %sender_key,
            "created inbound pairwise session"
        );
        Ok(plaintext)
    }

    fn decrypt_normal(
        &self,
        sender_key: &PublicKey,
        message: &PairwiseCiphertext,
    ) -> Result<Vec<u8>, EngineError> {
        let sessions = self.store.get_sessions(sender_key)?;
        let tried = sessions.len();
        for mut session in sessions {
            match session.session.decrypt(self.backend, message) {
                Ok(plaintext) => {
                    session.last_decrypted = timestamp_millis();
                    self.store.update_session(sender_key, &session)?;
                    return Ok(plaintext);
                }
                Err(err) => {
                    debug!(
                        session_id = session.session_id(),
                        error = %err,
                        "session did not decrypt"
                    );
                }
            }
        }
        warn!(sender_key = %sender_key, tried, "no pairwise session could decrypt message");
        Err(EngineError::NoSessionFound {
            sender_key: sender_key.to_base64(),
        })
    }

    // ==================== Outbound group ====================

    /// Replace the room's outbound session with a fresh one. Returns the new
    /// session id.
    pub fn rotate_outbound_group_session(&self, room_id: &str) -> Result<String, EngineError> {
        self.with_room(room_id, || {
            let session = OutboundGroupSession::new(self.backend)?;
            Ok(self.store_outbound_locked(room_id, session)?.session_id())
        })
    }

    /// Make `session` the room's outbound session and install our own
    /// inbound copy of it. Caller holds the room lock.
    fn store_outbound_locked(
        &self,
        room_id: &str,
        session: OutboundGroupSession,
    ) -> Result<OutboundGroupSessionRecord, EngineError> {
        let now = timestamp_millis();
        let inbound =
            InboundGroupSession::from_session_key(self.backend, &session.session_key(self.backend)?)?;
        let mut own = InboundGroupSessionRecord::new(room_id, self.identity_key, inbound, now);
        own.max_age_ms = Some(self.policy.max_age_ms);
        own.max_messages = Some(self.policy.max_messages);

        let record = OutboundGroupSessionRecord::new(
            room_id,
            session,
            self.policy.max_age_ms,
            self.policy.max_messages,
            now,
        );
        self.store.replace_outbound_group_session(&record, &own)?;
        info!(
            room_id,
            session_id = %record.session_id(),
            message_index = record.session.message_index(),
            "rotated outbound group session"
        );
        Ok(record)
    }

    /// Encrypt with the room's outbound session and persist the advanced
    /// ratchet.
    pub fn encrypt_group(
        &self,
        room_id: &str,
        plaintext: &[u8],
    ) -> Result<EncryptedGroupMessage, EngineError> {
        self.with_room(room_id, || {
            let now = timestamp_millis();
            let Some(mut record) = self.store.get_outbound_group_session(room_id)? else {
                return Err(EngineError::NoOutboundGroupSession(room_id.to_string()));
            };
            if record.is_expired(now) {
                return Err(EngineError::OutboundSessionExpired(room_id.to_string()));
            }

            let ciphertext = record.session.encrypt(self.backend, plaintext)?;
            record.message_count += 1;
            record.last_used = now;
            self.store.update_outbound_group_session(&record)?;
            Ok(EncryptedGroupMessage {
                room_id: room_id.to_string(),
                session_id: record.session_id(),
                sender_key: self.identity_key,
                ciphertext,
            })
        })
    }

    /// Send the room's session key to every listed device that does not have
    /// it yet, rotating first if the session is missing or expired. Devices
    /// without a usable pairwise channel are skipped.
    pub fn share_group_session(
        &self,
        room_id: &str,
        devices: &[RemoteDevice],
    ) -> Result<Vec<ToDeviceMessage>, EngineError> {
        self.with_room(room_id, || {
            let now = timestamp_millis();
            let record = match self.store.get_outbound_group_session(room_id)? {
                Some(record) if !record.is_expired(now) => record,
                _ => {
                    let session = OutboundGroupSession::new(self.backend)?;
                    self.store_outbound_locked(room_id, session)?
                }
            };
            let session_id = record.session_id();
            let payload = Zeroizing::new(serde_json::to_vec(&ToDevicePayload::RoomKey(
                RoomKeyContent {
                    algorithm: MEGOLM_ALGORITHM.to_string(),
                    room_id: room_id.to_string(),
                    session_id: session_id.clone(),
                    session_key: record.session.session_key(self.backend)?,
                    max_age_ms: Some(record.max_age_ms),
                    max_messages: Some(record.max_messages),
                },
            ))?);

            let mut messages = Vec::new();
            for device in devices {
                if self.store.is_outbound_group_session_shared(
                    &device.user_id,
                    &device.identity_key,
                    &session_id,
                )? {
                    continue;
                }
                match self.encrypt_pairwise(device, &payload) {
                    Ok(ciphertext) => {
                        self.store.mark_outbound_group_session_shared(
                            &device.user_id,
                            &device.identity_key,
                            &session_id,
                        )?;
                        messages.push(ToDeviceMessage {
                            user_id: device.user_id.clone(),
                            device_id: device.device_id.clone(),
                            sender_key: self.identity_key,
                            ciphertext,
                        });
                    }
                    Err(err) if err.is_pending() => {
                        warn!(
                            room_id,
                            user_id = %device.user_id,
                            device_id = %device.device_id,
                            error = %err,
                            "skipping device without pairwise session"
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
            debug!(room_id, session_id = %session_id, count = messages.len(), "shared group session");
            Ok(messages)
        })
    }

    /// Export the room's outbound session as a quoted legacy pickle.
    pub fn export_outbound_group_session(
        &self,
        room_id: &str,
        passphrase: &[u8],
    ) -> Result<String, EngineError> {
        let record = self
            .store
            .get_outbound_group_session(room_id)?
            .ok_or_else(|| EngineError::NoOutboundGroupSession(room_id.to_string()))?;
        compat::pickle_to_json(self.backend, &record.session, passphrase)
    }

    /// Adopt an outbound session exported by
    /// [`SessionEngine::export_outbound_group_session`]. It replaces the
    /// room's current one and starts with an empty shared-with record.
    pub fn import_outbound_group_session(
        &self,
        room_id: &str,
        json: &str,
        passphrase: &[u8],
    ) -> Result<String, EngineError> {
        let session: OutboundGroupSession =
            compat::pickle_from_json(self.backend, json, passphrase)?;
        self.with_room(room_id, || {
            Ok(self.store_outbound_locked(room_id, session)?.session_id())
        })
    }

    // ==================== Inbound group ====================

    /// Store a received group session unless the one already held is at
    /// least as good. Returns whether the stored session changed.
    pub fn install_group_session(
        &self,
        mut record: InboundGroupSessionRecord,
    ) -> Result<bool, EngineError> {
        let GroupSessionState::Active(incoming) = &record.state else {
            return Err(EngineError::MalformedPayload(
                "cannot install a withheld session".to_string(),
            ));
        };
        let incoming_first = incoming.first_known_index();
        let incoming_verified = incoming.is_verified();
        let session_id = record.session_id.clone();

        self.store.with_group_session(&session_id, || -> Result<_, EngineError> {
            if let Some(existing) = self
                .store
                .get_group_session(&record.room_id, &record.session_id)?
            {
                if existing.sender_key != record.sender_key {
                    return Err(EngineError::SenderKeyMismatch {
                        expected: existing.sender_key.to_base64(),
                        actual: record.sender_key.to_base64(),
                    });
                }
                if let Some(current) = existing.session() {
                    let first_known = current.first_known_index();
                    if first_known <= incoming_first
                        && (current.is_verified() || !incoming_verified)
                    {
                        debug!(
                            session_id = %record.session_id,
                            first_known,
                            incoming_first,
                            "keeping existing group session"
                        );
                        self.retry.resolve(&record.session_id, first_known);
                        return Ok(false);
                    }
                    record.ratchet_safety = existing.ratchet_safety;
                }
            }

            self.store.put_group_session(&record)?;
            self.retry.resolve(&record.session_id, incoming_first);
            info!(
                room_id = %record.room_id,
                session_id = %record.session_id,
                sender_key = %record.sender_key,
                first_known = incoming_first,
                verified = incoming_verified,
                "installed group session"
            );
            Ok(true)
        })
    }

    /// Install a room key received over a pairwise channel from `sender_key`.
    pub fn install_room_key(
        &self,
        sender_key: PublicKey,
        content: &RoomKeyContent,
    ) -> Result<bool, EngineError> {
        if content.algorithm != MEGOLM_ALGORITHM {
            return Err(EngineError::MalformedPayload(format!(
                "unsupported room key algorithm {}",
                content.algorithm
            )));
        }
        let session = InboundGroupSession::from_session_key(self.backend, &content.session_key)?;
        if session.session_id() != content.session_id {
            return Err(EngineError::MalformedPayload(
                "session id does not match session key".to_string(),
            ));
        }
        let mut record =
            InboundGroupSessionRecord::new(&content.room_id, sender_key, session, timestamp_millis());
        record.max_age_ms = content.max_age_ms;
        record.max_messages = content.max_messages;
        self.install_group_session(record)
    }

    /// Process one batch of to-device events. Failures are collected per
    /// event; the batch itself only fails on a poisoned engine.
    pub fn handle_to_device_batch(&self, events: Vec<ToDeviceEvent>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for event in events {
            match event {
                ToDeviceEvent::Encrypted {
                    sender_key,
                    ciphertext,
                } => {
                    if let Err(err) = self.handle_encrypted(sender_key, &ciphertext, &mut outcome) {
                        warn!(sender_key = %sender_key, error = %err, "failed to handle to-device event");
                        outcome.record_failure(sender_key.to_base64(), err);
                    }
                }
                ToDeviceEvent::RoomKeyWithheld(notice) => {
                    match self.store.put_withheld_group_session(&notice) {
                        Ok(()) => {
                            debug!(
                                session_id = %notice.session_id,
                                room_id = %notice.room_id,
                                code = %notice.code,
                                "recorded withheld notice"
                            );
                            outcome.withheld_sessions.push(notice.session_id);
                        }
                        Err(err) => outcome.record_failure(notice.sender_key.to_base64(), err.into()),
                    }
                }
            }
        }
        outcome
    }

    fn handle_encrypted(
        &self,
        sender_key: PublicKey,
        ciphertext: &PairwiseCiphertext,
        outcome: &mut BatchOutcome,
    ) -> Result<(), EngineError> {
        let plaintext = Zeroizing::new(self.decrypt_pairwise(&sender_key, ciphertext)?);
        match serde_json::from_slice::<ToDevicePayload>(&plaintext)? {
            ToDevicePayload::RoomKey(content) => {
                if self.install_room_key(sender_key, &content)? {
                    outcome.installed_sessions.push(content.session_id.clone());
                }
            }
            ToDevicePayload::Unknown => debug!(sender_key = %sender_key, "ignoring to-device payload"),
        }
        Ok(())
    }

    /// Decrypt one room event. Missing keys are queued on the retry queue.
    pub fn decrypt_group(
        &self,
        event: &EncryptedRoomEvent,
    ) -> Result<DecryptedRoomEvent, EngineError> {
        let mut queued = false;
        self.decrypt_group_tracked(event, &mut queued)
    }

    /// Decrypt a batch of room events in order. Failures and retry-queue
    /// growth land in `outcome`.
    pub fn decrypt_room_events(
        &self,
        events: &[EncryptedRoomEvent],
        outcome: &mut BatchOutcome,
    ) -> Vec<DecryptedRoomEvent> {
        let mut decrypted = Vec::with_capacity(events.len());
        for event in events {
            let mut queued = false;
            match self.decrypt_group_tracked(event, &mut queued) {
                Ok(plain) => decrypted.push(plain),
                Err(err) => outcome.record_failure(event.event_id.clone(), err),
            }
            outcome.wakeup_request_queue |= queued;
        }
        decrypted
    }

    fn decrypt_group_tracked(
        &self,
        event: &EncryptedRoomEvent,
        queued: &mut bool,
    ) -> Result<DecryptedRoomEvent, EngineError> {
        let session_id = event.session_id.as_str();
        let index = peek_message_index(&event.ciphertext)?;

        let Some(record) = self.store.get_group_session(&event.room_id, session_id)? else {
            *queued |= self
                .retry
                .request(&event.room_id, session_id, event.sender_key, index);
            return Err(EngineError::NoGroupSession {
                room_id: event.room_id.clone(),
                session_id: session_id.to_string(),
            });
        };
        if record.sender_key != event.sender_key {
            return Err(EngineError::SenderKeyMismatch {
                expected: record.sender_key.to_base64(),
                actual: event.sender_key.to_base64(),
            });
        }

        let session = match &record.state {
            GroupSessionState::Active(session) => session,
            GroupSessionState::Withheld(info) => {
                *queued |= self
                    .retry
                    .request(&event.room_id, session_id, event.sender_key, index);
                warn!(
                    session_id,
                    event_id = %event.event_id,
                    code = %info.code,
                    "group session was withheld"
                );
                return Err(EngineError::GroupSessionWithheld {
                    session_id: session_id.to_string(),
                    code: info.code.clone(),
                    reason: info.reason.clone(),
                });
            }
        };

        let plain = match session.decrypt(self.backend, &event.ciphertext) {
            Ok(plain) => plain,
            Err(RatchetError::UnknownMessageIndex {
                first_known,
                requested,
            }) => {
                *queued |= self
                    .retry
                    .request(&event.room_id, session_id, event.sender_key, requested);
                warn!(session_id, first_known, requested, "message predates known group ratchet");
                return Err(EngineError::UnknownMessageIndex {
                    session_id: session_id.to_string(),
                    first_known,
                    requested,
                });
            }
            Err(err) => return Err(err.into()),
        };

        if !self.replay.validate_message_index(
            &event.sender_key.to_base64(),
            session_id,
            plain.message_index,
            &event.event_id,
            event.timestamp,
        )? {
            return Err(EngineError::DuplicateMessageIndex {
                session_id: session_id.to_string(),
                index: plain.message_index,
            });
        }

        let first_known = session.first_known_index();
        self.store.with_group_session(session_id, || {
            self.store
                .record_ratchet_safety(session_id, plain.message_index, first_known)
        })?;
        self.retry.resolve(session_id, first_known);

        Ok(DecryptedRoomEvent {
            room_id: event.room_id.clone(),
            event_id: event.event_id.clone(),
            plaintext: plain.plaintext,
            message_index: plain.message_index,
            verified: session.is_verified(),
            forwarding_chains: record.forwarding_chains.clone(),
        })
    }

    /// Export an inbound session in the legacy unsigned format, starting at
    /// `index` or at its first known index.
    pub fn export_group_session(
        &self,
        room_id: &str,
        session_id: &str,
        index: Option<u32>,
    ) -> Result<String, EngineError> {
        let Some(record) = self.store.get_group_session(room_id, session_id)? else {
            return Err(EngineError::NoGroupSession {
                room_id: room_id.to_string(),
                session_id: session_id.to_string(),
            });
        };
        let session = match record.state {
            GroupSessionState::Active(session) => session,
            GroupSessionState::Withheld(info) => {
                return Err(EngineError::GroupSessionWithheld {
                    session_id: session_id.to_string(),
                    code: info.code,
                    reason: info.reason,
                });
            }
        };
        let index = index.unwrap_or(session.first_known_index());
        let exported = session
            .export_at(self.backend, index)
            .map_err(|err| match err {
                RatchetError::UnknownMessageIndex {
                    first_known,
                    requested,
                } => EngineError::UnknownMessageIndex {
                    session_id: session_id.to_string(),
                    first_known,
                    requested,
                },
                other => other.into(),
            })?;
        Ok(compat::export_to_base64(&exported))
    }

    /// Import a legacy unsigned export for `room_id`, attributed to
    /// `sender_key`. The imported session is unverified.
    pub fn import_group_session(
        &self,
        room_id: &str,
        sender_key: PublicKey,
        exported: &str,
    ) -> Result<String, EngineError> {
        let session = InboundGroupSession::import(&compat::export_from_base64(exported)?);
        let session_id = session.session_id();
        let record = InboundGroupSessionRecord::new(room_id, sender_key, session, timestamp_millis());
        self.install_group_session(record)?;
        Ok(session_id)
    }

    /// Destroy received sessions in `room_id` and/or from `sender_key`.
    pub fn redact_group_sessions(
        &self,
        room_id: Option<&str>,
        sender_key: Option<&PublicKey>,
        reason: &str,
    ) -> Result<Vec<String>, EngineError> {
        Ok(self.store.redact_group_sessions(room_id, sender_key, reason)?)
    }

    /// Drop stale pairwise message hashes and redact expired group sessions
    /// along with those too old to carry a receipt time.
    pub fn prune(&self) -> Result<PruneReport, EngineError> {
        let cutoff = timestamp_millis().saturating_sub(self.message_hash_retention_ms);
        let message_hashes = self.store.delete_old_message_hashes(cutoff)?;
        let mut redacted_sessions = self.store.redact_expired_group_sessions()?;
        redacted_sessions.extend(self.store.redact_outdated_group_sessions()?);
        info!(
            message_hashes,
            redacted_sessions = redacted_sessions.len(),
            "pruned session store"
        );
        Ok(PruneReport {
            message_hashes,
            redacted_sessions,
        })
    }

    // ==================== Cross-signing ====================

    /// Build the signed key objects for `keys` and record every signature
    /// locally. The device key signs the master key; the master key signs
    /// the two sub-keys.
    pub fn publish_cross_signing(
        &self,
        keys: &CrossSigningKeys,
    ) -> Result<CrossSigningUpload, EngineError> {
        let public = keys.public_keys();
        let user_id = self.user_id.as_str();

        let mut master = CrossSigningKey::new(user_id, USAGE_MASTER, &public.master);
        let device_signature = self.sign(&master.canonical_json()?)?;
        master.add_signature(
            user_id,
            format!("ed25519:{}", self.device_id),
            &device_signature,
        );

        let mut self_signing = CrossSigningKey::new(user_id, USAGE_SELF_SIGNING, &public.self_signing);
        let self_signing_signature = keys.sign_with_master(self.backend, user_id, &mut self_signing)?;
        let mut user_signing = CrossSigningKey::new(user_id, USAGE_USER_SIGNING, &public.user_signing);
        let user_signing_signature = keys.sign_with_master(self.backend, user_id, &mut user_signing)?;

        self.store.put_signature(
            user_id,
            &public.master,
            user_id,
            &self.signing_key,
            &device_signature,
        )?;
        self.store.put_signature(
            user_id,
            &public.self_signing,
            user_id,
            &public.master,
            &self_signing_signature,
        )?;
        self.store.put_signature(
            user_id,
            &public.user_signing,
            user_id,
            &public.master,
            &user_signing_signature,
        )?;
        info!(user_id, master = %public.master, "signed cross-signing keys");

        Ok(CrossSigningUpload {
            master,
            self_signing,
            user_signing,
        })
    }
}
