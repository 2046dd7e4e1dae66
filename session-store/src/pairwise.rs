//! Pairwise session persistence and pairwise message-hash deduplication.

use crypto::PublicKey;
use storage::{Connection, OptionalExtension, Row, StorageError, params};
use tracing::debug;

use crate::{
    errors::StoreError,
    store::SessionStore,
    types::{DeviceSession, sort_by_usefulness},
};

const SELECT_SESSIONS: &str = "
    SELECT session, created_at, last_encrypted, last_decrypted
    FROM olm_session
    WHERE account_id = ?1 AND sender_key = ?2
    ORDER BY last_decrypted DESC, created_at DESC
";

struct SessionRow {
    pickled: Vec<u8>,
    created_at: i64,
    last_encrypted: i64,
    last_decrypted: i64,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> Result<Self, storage::RusqliteError> {
        Ok(Self {
            pickled: row.get(0)?,
            created_at: row.get(1)?,
            last_encrypted: row.get(2)?,
            last_decrypted: row.get(3)?,
        })
    }
}

impl SessionStore {
    fn load_device_sessions(
        &self,
        conn: &Connection,
        sender_key: &str,
        limit: Option<u32>,
    ) -> Result<Vec<DeviceSession>, StoreError> {
        let sql = match limit {
            Some(limit) => format!("{SELECT_SESSIONS} LIMIT {limit}"),
            None => SELECT_SESSIONS.to_string(),
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![self.account_id, sender_key], SessionRow::from_row)?;

        let mut sessions = Vec::new();
        for row in rows {
            let row = row?;
            sessions.push(DeviceSession {
                session: self.unpickle(&row.pickled)?,
                created_at: row.created_at,
                last_encrypted: row.last_encrypted,
                last_decrypted: row.last_decrypted,
            });
        }
        Ok(sessions)
    }

    /// Whether any pairwise session exists for `sender_key`. Consults the
    /// cache first and never unpickles on a miss.
    pub fn has_session(&self, sender_key: &PublicKey) -> Result<bool, StoreError> {
        let key = sender_key.to_base64();
        if self
            .olm_cache
            .get(&key)
            .is_some_and(|cached| !cached.is_empty())
        {
            return Ok(true);
        }
        self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM olm_session WHERE account_id = ?1 AND sender_key = ?2)",
                params![self.account_id, key],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })
    }

    /// All sessions for `sender_key`, most recently useful first.
    pub fn get_sessions(&self, sender_key: &PublicKey) -> Result<Vec<DeviceSession>, StoreError> {
        let key = sender_key.to_base64();
        if let Some(cached) = self.olm_cache.get(&key) {
            return Ok(cached.value().clone());
        }

        let sessions = self
            .db
            .with_connection(|conn| self.load_device_sessions(conn, &key, None))?;
        self.olm_cache.insert(key, sessions.clone());
        Ok(sessions)
    }

    /// The head of [`SessionStore::get_sessions`]'s ordering.
    pub fn get_latest_session(
        &self,
        sender_key: &PublicKey,
    ) -> Result<Option<DeviceSession>, StoreError> {
        let key = sender_key.to_base64();
        if let Some(cached) = self.olm_cache.get(&key) {
            return Ok(cached.first().cloned());
        }
        let mut sessions = self
            .db
            .with_connection(|conn| self.load_device_sessions(conn, &key, Some(1)))?;
        Ok(sessions.pop())
    }

    /// Creation time of the newest session with `sender_key`, if any.
    pub fn get_newest_session_creation_ts(
        &self,
        sender_key: &PublicKey,
    ) -> Result<Option<i64>, StoreError> {
        self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT MAX(created_at) FROM olm_session WHERE account_id = ?1 AND sender_key = ?2",
                params![self.account_id, sender_key.to_base64()],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })
    }

    pub fn add_session(
        &self,
        sender_key: &PublicKey,
        session: &DeviceSession,
    ) -> Result<(), StoreError> {
        let key = sender_key.to_base64();
        let pickled = self.pickle(&session.session)?;
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO olm_session
                    (account_id, session_id, sender_key, session, created_at, last_encrypted, last_decrypted)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    self.account_id,
                    session.session_id(),
                    key,
                    pickled,
                    session.created_at,
                    session.last_encrypted,
                    session.last_decrypted,
                ],
            )
            .map_err(StoreError::from)
        })?;
        debug!(session_id = session.session_id(), sender_key = %key, "added pairwise session");

        if let Some(mut cached) = self.olm_cache.get_mut(&key) {
            cached.push(session.clone());
            sort_by_usefulness(&mut cached);
        }
        Ok(())
    }

    /// Persist a session's ratchet and timestamps after it was used.
    pub fn update_session(
        &self,
        sender_key: &PublicKey,
        session: &DeviceSession,
    ) -> Result<(), StoreError> {
        let key = sender_key.to_base64();
        let pickled = self.pickle(&session.session)?;
        let changed = self.db.with_connection(|conn| {
            conn.execute(
                "UPDATE olm_session SET session = ?1, last_encrypted = ?2, last_decrypted = ?3
                 WHERE account_id = ?4 AND session_id = ?5",
                params![
                    pickled,
                    session.last_encrypted,
                    session.last_decrypted,
                    self.account_id,
                    session.session_id(),
                ],
            )
            .map_err(StoreError::from)
        })?;
        if changed == 0 {
            return Err(StoreError::from(StorageError::NotFound(format!(
                "pairwise session {}",
                session.session_id()
            ))));
        }

        if let Some(mut cached) = self.olm_cache.get_mut(&key) {
            if let Some(slot) = cached
                .iter_mut()
                .find(|s| s.session_id() == session.session_id())
            {
                *slot = session.clone();
            }
            sort_by_usefulness(&mut cached);
        }
        Ok(())
    }

    pub fn delete_session(&self, sender_key: &PublicKey, session_id: &str) -> Result<(), StoreError> {
        let key = sender_key.to_base64();
        self.db.with_connection(|conn| {
            conn.execute(
                "DELETE FROM olm_session WHERE account_id = ?1 AND session_id = ?2",
                params![self.account_id, session_id],
            )
            .map_err(StoreError::from)
        })?;
        if let Some(mut cached) = self.olm_cache.get_mut(&key) {
            cached.retain(|s| s.session_id() != session_id);
        }
        Ok(())
    }

    // ==================== Message Hash Operations ====================

    /// Remember that a pairwise ciphertext with this hash was received.
    pub fn put_message_hash(&self, hash: &[u8; 32], received_at: i64) -> Result<(), StoreError> {
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO olm_message_hash (account_id, message_hash, received_at)
                 VALUES (?1, ?2, ?3) ON CONFLICT (account_id, message_hash) DO NOTHING",
                params![self.account_id, hash.as_slice(), received_at],
            )?;
            Ok(())
        })
    }

    /// When a ciphertext with this hash was first received, if ever.
    pub fn get_message_hash(&self, hash: &[u8; 32]) -> Result<Option<i64>, StoreError> {
        self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT received_at FROM olm_message_hash
                 WHERE account_id = ?1 AND message_hash = ?2",
                params![self.account_id, hash.as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)
        })
    }

    /// Forget hashes received before `before`. Returns how many were removed.
    pub fn delete_old_message_hashes(&self, before: i64) -> Result<usize, StoreError> {
        self.db.with_connection(|conn| {
            conn.execute(
                "DELETE FROM olm_message_hash WHERE account_id = ?1 AND received_at < ?2",
                params![self.account_id, before],
            )
            .map_err(StoreError::from)
        })
    }
}

#[cfg(test)]
mod tests {
    use double_ratchets::{Account, PairwiseSession, RatchetBackend};

    use super::*;
    use crate::store::tests::{backend, test_store};

    struct Peer {
        account: Account,
        remote: Account,
    }

    impl Peer {
        fn new() -> Self {
            let account = backend().generate_identity().unwrap();
            let mut remote = backend().generate_identity().unwrap();
            remote.generate_one_time_keys(backend(), 4).unwrap();
            Self { account, remote }
        }

        fn sender_key(&self) -> PublicKey {
            self.remote.identity_key()
        }

        fn session(&self, n: usize) -> PairwiseSession {
            let otk = self.remote.one_time_keys()[n];
            backend()
                .create_outbound_session(&self.account, self.remote.identity_key(), otk)
                .unwrap()
        }
    }

    #[test]
    fn test_sessions_ordered_by_last_decrypted_then_created() {
        let store = test_store();
        let peer = Peer::new();
        let key = peer.sender_key();

        let old_useful = DeviceSession {
            session: peer.session(0),
            created_at: 100,
            last_encrypted: 100,
            last_decrypted: 500,
        };
        let newer_idle = DeviceSession {
            session: peer.session(1),
            created_at: 300,
            last_encrypted: 300,
            last_decrypted: 300,
        };
        let tie_newer = DeviceSession {
            session: peer.session(2),
            created_at: 400,
            last_encrypted: 400,
            last_decrypted: 300,
        };
        for s in [&newer_idle, &old_useful, &tie_newer] {
            store.add_session(&key, s).unwrap();
        }

        let expected = vec![
            old_useful.session_id().to_string(),
            tie_newer.session_id().to_string(),
            newer_idle.session_id().to_string(),
        ];
        let ids = |sessions: Vec<DeviceSession>| {
            sessions
                .iter()
                .map(|s| s.session_id().to_string())
                .collect::<Vec<_>>()
        };

        // From the database, then from the cache it populated.
        assert_eq!(ids(store.get_sessions(&key).unwrap()), expected);
        assert_eq!(ids(store.get_sessions(&key).unwrap()), expected);
        assert_eq!(
            store.get_latest_session(&key).unwrap().unwrap().session_id(),
            old_useful.session_id()
        );
        assert_eq!(store.get_newest_session_creation_ts(&key).unwrap(), Some(400));
    }

    #[test]
    fn test_latest_session_without_cache() {
        let store = test_store();
        let peer = Peer::new();
        let key = peer.sender_key();

        let first = DeviceSession::new(peer.session(0), 10);
        let second = DeviceSession::new(peer.session(1), 20);
        store.add_session(&key, &first).unwrap();
        store.add_session(&key, &second).unwrap();

        assert!(store.olm_cache.get(&key.to_base64()).is_none());
        assert_eq!(
            store.get_latest_session(&key).unwrap().unwrap().session_id(),
            second.session_id()
        );
    }

    #[test]
    fn test_update_reorders_cache() {
        let store = test_store();
        let peer = Peer::new();
        let key = peer.sender_key();

        let first = DeviceSession::new(peer.session(0), 10);
        let second = DeviceSession::new(peer.session(1), 20);
        store.add_session(&key, &first).unwrap();
        store.add_session(&key, &second).unwrap();
        assert_eq!(
            store.get_sessions(&key).unwrap()[0].session_id(),
            second.session_id()
        );

        let mut used = first.clone();
        used.last_decrypted = 30;
        store.update_session(&key, &used).unwrap();
        assert_eq!(
            store.get_sessions(&key).unwrap()[0].session_id(),
            first.session_id()
        );

        store.olm_cache.clear();
        assert_eq!(
            store.get_sessions(&key).unwrap()[0].session_id(),
            first.session_id()
        );
    }

    #[test]
    fn test_has_session_and_delete() {
        let store = test_store();
        let peer = Peer::new();
        let key = peer.sender_key();
        assert!(!store.has_session(&key).unwrap());

        let session = DeviceSession::new(peer.session(0), 1);
        store.add_session(&key, &session).unwrap();
        assert!(store.has_session(&key).unwrap());
        store.get_sessions(&key).unwrap();

        store.delete_session(&key, session.session_id()).unwrap();
        assert!(!store.has_session(&key).unwrap());
        assert!(store.get_sessions(&key).unwrap().is_empty());
    }

    #[test]
    fn test_update_of_unknown_session_fails() {
        let store = test_store();
        let peer = Peer::new();
        let session = DeviceSession::new(peer.session(0), 1);
        assert!(store.update_session(&peer.sender_key(), &session).is_err());
    }

    #[test]
    fn test_sessions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = storage::StorageConfig::File {
            path: dir.path().join("sessions.db"),
        };
        let peer = Peer::new();
        let key = peer.sender_key();
        let mut session = DeviceSession::new(peer.session(0), 5);

        {
            let store = SessionStore::new(&config, "acct", b"pickle", backend()).unwrap();
            store.add_session(&key, &session).unwrap();
            session.session.encrypt(backend(), b"advance").unwrap();
            session.last_encrypted = 6;
            store.update_session(&key, &session).unwrap();
        }

        let store = SessionStore::new(&config, "acct", b"pickle", backend()).unwrap();
        let mut loaded = store.get_latest_session(&key).unwrap().unwrap();
        assert_eq!(loaded.session_id(), session.session_id());
        assert_eq!(loaded.last_encrypted, 6);

        // The restored ratchet continues where the stored one left off.
        let expected = session.session.encrypt(backend(), b"next").unwrap();
        let actual = loaded.session.encrypt(backend(), b"next").unwrap();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_message_hashes() {
        let store = test_store();
        let hash = backend().sha256(b"ciphertext");

        assert_eq!(store.get_message_hash(&hash).unwrap(), None);
        store.put_message_hash(&hash, 1_000).unwrap();
        store.put_message_hash(&hash, 2_000).unwrap();
        assert_eq!(store.get_message_hash(&hash).unwrap(), Some(1_000));

        assert_eq!(store.delete_old_message_hashes(500).unwrap(), 0);
        assert_eq!(store.delete_old_message_hashes(1_001).unwrap(), 1);
        assert_eq!(store.get_message_hash(&hash).unwrap(), None);
    }

    #[test]
    fn test_message_hashes_are_per_account() {
        let dir = tempfile::tempdir().unwrap();
        let config = storage::StorageConfig::File {
            path: dir.path().join("sessions.db"),
        };
        let first = SessionStore::new(&config, "first", b"pickle", backend()).unwrap();
        let second = SessionStore::new(&config, "second", b"pickle", backend()).unwrap();
        let hash = backend().sha256(b"ciphertext");

        first.put_message_hash(&hash, 1_000).unwrap();
        assert_eq!(second.get_message_hash(&hash).unwrap(), None);

        second.put_message_hash(&hash, 2_000).unwrap();
        assert_eq!(first.get_message_hash(&hash).unwrap(), Some(1_000));
        assert_eq!(second.get_message_hash(&hash).unwrap(), Some(2_000));
    }
}
