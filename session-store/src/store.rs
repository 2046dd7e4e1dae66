//! The session store: one SQLite database per process, one account per
//! store, and an in-memory cache of pairwise sessions.

use std::sync::{Arc, Mutex};

use crypto::PublicKey;
use dashmap::DashMap;
use double_ratchets::{Account, Pickle, RatchetBackend};
use storage::{OptionalExtension, SqliteDb, StorageBackend, StorageConfig, params};
use tracing::debug;
use zeroize::Zeroizing;

use crate::{errors::StoreError, types::DeviceSession};

/// Schema for session storage tables.
const SESSION_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS account (
        account_id TEXT PRIMARY KEY,
        account BLOB NOT NULL
    );

    CREATE TABLE IF NOT EXISTS olm_session (
        account_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        sender_key TEXT NOT NULL,
        session BLOB NOT NULL,
        created_at INTEGER NOT NULL,
        last_encrypted INTEGER NOT NULL,
        last_decrypted INTEGER NOT NULL,
        PRIMARY KEY (account_id, session_id)
    );

    CREATE INDEX IF NOT EXISTS idx_olm_session_sender
        ON olm_session(account_id, sender_key);

    CREATE TABLE IF NOT EXISTS olm_message_hash (
        account_id TEXT NOT NULL,
        message_hash BLOB NOT NULL,
        received_at INTEGER NOT NULL,
        PRIMARY KEY (account_id, message_hash)
    );

    -- A row holds either a ratchet or a withheld code, never both.
    CREATE TABLE IF NOT EXISTS megolm_inbound_session (
        account_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        sender_key TEXT NOT NULL,
        signing_key TEXT,
        room_id TEXT NOT NULL,
        session BLOB,
        forwarding_chains TEXT,
        ratchet_safety TEXT,
        received_at INTEGER,
        max_age INTEGER,
        max_messages INTEGER,
        is_scheduled INTEGER NOT NULL DEFAULT 0,
        withheld_code TEXT,
        withheld_reason TEXT,
        key_backup_version TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (account_id, session_id),
        CHECK ((session IS NULL) <> (withheld_code IS NULL))
    );

    CREATE INDEX IF NOT EXISTS idx_megolm_inbound_room
        ON megolm_inbound_session(account_id, room_id);

    CREATE TABLE IF NOT EXISTS megolm_outbound_session (
        account_id TEXT NOT NULL,
        room_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        session BLOB NOT NULL,
        max_messages INTEGER NOT NULL,
        message_count INTEGER NOT NULL,
        max_age INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        last_used INTEGER NOT NULL,
        PRIMARY KEY (account_id, room_id)
    );

    CREATE TABLE IF NOT EXISTS megolm_outbound_session_shared (
        account_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        identity_key TEXT NOT NULL,
        session_id TEXT NOT NULL,
        PRIMARY KEY (account_id, user_id, identity_key, session_id)
    );

    CREATE TABLE IF NOT EXISTS message_index (
        sender_key TEXT NOT NULL,
        session_id TEXT NOT NULL,
        idx INTEGER NOT NULL,
        event_id TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        PRIMARY KEY (sender_key, session_id, idx)
    );

    CREATE TABLE IF NOT EXISTS cross_signing_signatures (
        signed_user_id TEXT NOT NULL,
        signed_key TEXT NOT NULL,
        signer_user_id TEXT NOT NULL,
        signer_key TEXT NOT NULL,
        signature TEXT NOT NULL,
        PRIMARY KEY (signed_user_id, signed_key, signer_user_id, signer_key)
    );
";

/// Persistent repository for accounts, pairwise sessions and group sessions.
///
/// Everything secret is written as a passphrase-sealed pickle under the
/// store's pickle key. Pairwise sessions are cached per sender key; a cache
/// entry, once present, holds every session for that key.
pub struct SessionStore {
    pub(crate) db: Arc<SqliteDb>,
    pub(crate) account_id: String,
    pub(crate) pickle_key: Zeroizing<Vec<u8>>,
    pub(crate) backend: &'static dyn RatchetBackend,
    pub(crate) olm_cache: DashMap<String, Vec<DeviceSession>>,
    device_locks: DashMap<String, Arc<Mutex<()>>>,
    group_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionStore {
    /// Opens the store described by `config` and creates any missing tables.
    pub fn new(
        config: &StorageConfig,
        account_id: impl Into<String>,
        pickle_key: &[u8],
        backend: &'static dyn RatchetBackend,
    ) -> Result<Self, StoreError> {
        let db = SqliteDb::new(config)?;
        Self::run_migration(Arc::new(db), account_id.into(), pickle_key, backend)
    }

    /// Creates an in-memory store (useful for testing).
    pub fn in_memory(
        account_id: impl Into<String>,
        pickle_key: &[u8],
        backend: &'static dyn RatchetBackend,
    ) -> Result<Self, StoreError> {
        Self::new(&StorageConfig::InMemory, account_id, pickle_key, backend)
    }

    fn run_migration(
        db: Arc<SqliteDb>,
        account_id: String,
        pickle_key: &[u8],
        backend: &'static dyn RatchetBackend,
    ) -> Result<Self, StoreError> {
        if pickle_key.is_empty() {
            return Err(StoreError::InvalidArgument("pickle key must not be empty"));
        }
        db.execute_batch(SESSION_SCHEMA)?;
        Ok(Self {
            db,
            account_id,
            pickle_key: Zeroizing::new(pickle_key.to_vec()),
            backend,
            olm_cache: DashMap::new(),
            device_locks: DashMap::new(),
            group_locks: DashMap::new(),
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn backend(&self) -> &'static dyn RatchetBackend {
        self.backend
    }

    /// The shared database handle, for components such as the replay guard
    /// that keep their own tables in the same file.
    pub fn db(&self) -> Arc<SqliteDb> {
        Arc::clone(&self.db)
    }

    pub(crate) fn pickle<P: Pickle>(&self, value: &P) -> Result<Vec<u8>, StoreError> {
        Ok(value.pickle(self.backend, &self.pickle_key)?)
    }

    pub(crate) fn unpickle<P: Pickle>(&self, bytes: &[u8]) -> Result<P, StoreError> {
        Ok(P::unpickle(self.backend, bytes, &self.pickle_key)?)
    }

    /// Runs `f` while holding the lock for `sender_key`'s session set.
    /// Different devices never contend.
    pub fn with_device<T, E, F>(&self, sender_key: &PublicKey, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<StoreError>,
    {
        let lock = Arc::clone(
            self.device_locks
                .entry(sender_key.to_base64())
                .or_default()
                .value(),
        );
        let _guard = lock.lock().map_err(|_| StoreError::LockPoisoned)?;
        f()
    }

    /// Runs `f` while holding the lock for one inbound group session. Used
    /// to make read-modify-write of a session row atomic.
    pub fn with_group_session<T, E, F>(&self, session_id: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<StoreError>,
    {
        let lock = Arc::clone(self.group_locks.entry(session_id.to_string()).or_default().value());
        let _guard = lock.lock().map_err(|_| StoreError::LockPoisoned)?;
        f()
    }

    // ==================== Account Operations ====================

    /// Saves the account, replacing any previous one.
    pub fn put_account(&self, account: &Account) -> Result<(), StoreError> {
        let pickled = self.pickle(account)?;
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO account (account_id, account) VALUES (?1, ?2)
                 ON CONFLICT(account_id) DO UPDATE SET account = excluded.account",
                params![self.account_id, pickled],
            )?;
            debug!(account_id = %self.account_id, "stored account");
            Ok(())
        })
    }

    /// Loads the account if one has been stored.
    pub fn get_account(&self) -> Result<Option<Account>, StoreError> {
        let pickled: Option<Vec<u8>> = self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT account FROM account WHERE account_id = ?1",
                params![self.account_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)
        })?;
        pickled.map(|bytes| self.unpickle(&bytes)).transpose()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use double_ratchets::{PickleError, PortableBackend};

    pub(crate) fn backend() -> &'static dyn RatchetBackend {
        &PortableBackend
    }

    pub(crate) fn test_store() -> SessionStore {
        SessionStore::in_memory("@alice:example.org/DEVICE", b"store pickle key", backend())
            .unwrap()
    }

    #[test]
    fn test_account_roundtrip() {
        let store = test_store();
        assert!(store.get_account().unwrap().is_none());

        let mut account = backend().generate_identity().unwrap();
        account.generate_one_time_keys(backend(), 3).unwrap();
        store.put_account(&account).unwrap();

        let loaded = store.get_account().unwrap().unwrap();
        assert_eq!(loaded.identity_key(), account.identity_key());
        assert_eq!(loaded.one_time_keys(), account.one_time_keys());

        let consumed = account.one_time_keys()[0];
        account.remove_one_time_key(&consumed);
        store.put_account(&account).unwrap();
        assert_eq!(store.get_account().unwrap().unwrap().one_time_keys().len(), 2);
    }

    #[test]
    fn test_empty_pickle_key_rejected() {
        let result = SessionStore::in_memory("acct", b"", backend());
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
    }

    #[test]
    fn test_wrong_pickle_key_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::File {
            path: dir.path().join("sessions.db"),
        };
        let account = backend().generate_identity().unwrap();
        SessionStore::new(&config, "acct", b"right", backend())
            .unwrap()
            .put_account(&account)
            .unwrap();

        let reopened = SessionStore::new(&config, "acct", b"wrong", backend()).unwrap();
        assert!(matches!(
            reopened.get_account(),
            Err(StoreError::Pickle(PickleError::BadPassphrase))
        ));
    }

    #[test]
    fn test_device_locks_are_independent() {
        let store = test_store();
        let a = backend().generate_identity().unwrap().identity_key();
        let b = backend().generate_identity().unwrap().identity_key();

        let nested: Result<u32, StoreError> =
            store.with_device(&a, || store.with_device(&b, || Ok(7)));
        assert_eq!(nested.unwrap(), 7);
    }
}
