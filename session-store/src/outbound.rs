//! Outbound group sessions and the record of who has received them.

use crypto::PublicKey;
use storage::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::debug;

use crate::{
    errors::StoreError,
    store::SessionStore,
    types::{InboundGroupSessionRecord, OutboundGroupSessionRecord},
};

impl SessionStore {
    /// Store the room's outbound session, replacing whatever was there.
    pub fn add_outbound_group_session(
        &self,
        record: &OutboundGroupSessionRecord,
    ) -> Result<(), StoreError> {
        self.db
            .with_connection(|conn| self.insert_outbound(conn, record))?;
        debug!(room_id = %record.room_id, session_id = %record.session_id(), "stored outbound group session");
        Ok(())
    }

    /// Make `record` the room's outbound session and store `own`, the
    /// device's inbound copy of it, in one transaction. The previous
    /// outbound session and its shared-with record are dropped.
    pub fn replace_outbound_group_session(
        &self,
        record: &OutboundGroupSessionRecord,
        own: &InboundGroupSessionRecord,
    ) -> Result<(), StoreError> {
        self.db.with_transaction(TransactionBehavior::Immediate, |tx| {
            self.delete_outbound(tx, &record.room_id)?;
            self.insert_outbound(tx, record)?;
            self.upsert_group_session(tx, own)
        })?;
        debug!(room_id = %record.room_id, session_id = %record.session_id(), "replaced outbound group session");
        Ok(())
    }

    fn insert_outbound(
        &self,
        conn: &Connection,
        record: &OutboundGroupSessionRecord,
    ) -> Result<(), StoreError> {
        let pickled = self.pickle(&record.session)?;
        conn.execute(
            "INSERT INTO megolm_outbound_session
                (account_id, room_id, session_id, session, max_messages, message_count,
                 max_age, created_at, last_used)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (account_id, room_id) DO UPDATE SET
                session_id = excluded.session_id,
                session = excluded.session,
                max_messages = excluded.max_messages,
                message_count = excluded.message_count,
                max_age = excluded.max_age,
                created_at = excluded.created_at,
                last_used = excluded.last_used",
            params![
                self.account_id,
                record.room_id,
                record.session_id(),
                pickled,
                record.max_messages,
                record.message_count,
                record.max_age_ms,
                record.created_at,
                record.last_used,
            ],
        )?;
        Ok(())
    }

    fn delete_outbound(&self, conn: &Connection, room_id: &str) -> Result<(), StoreError> {
        conn.execute(
            "DELETE FROM megolm_outbound_session_shared
             WHERE account_id = ?1 AND session_id IN (
                SELECT session_id FROM megolm_outbound_session
                WHERE account_id = ?1 AND room_id = ?2
             )",
            params![self.account_id, room_id],
        )?;
        conn.execute(
            "DELETE FROM megolm_outbound_session WHERE account_id = ?1 AND room_id = ?2",
            params![self.account_id, room_id],
        )?;
        Ok(())
    }

    /// Persist the ratchet and counters after encrypting. Only touches the
    /// row if it still holds the same session.
    pub fn update_outbound_group_session(
        &self,
        record: &OutboundGroupSessionRecord,
    ) -> Result<(), StoreError> {
        let pickled = self.pickle(&record.session)?;
        self.db.with_connection(|conn| {
            conn.execute(
                "UPDATE megolm_outbound_session
                 SET session = ?1, message_count = ?2, last_used = ?3
                 WHERE account_id = ?4 AND room_id = ?5 AND session_id = ?6",
                params![
                    pickled,
                    record.message_count,
                    record.last_used,
                    self.account_id,
                    record.room_id,
                    record.session_id(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_outbound_group_session(
        &self,
        room_id: &str,
    ) -> Result<Option<OutboundGroupSessionRecord>, StoreError> {
        let row = self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT session, max_messages, message_count, max_age, created_at, last_used
                 FROM megolm_outbound_session WHERE account_id = ?1 AND room_id = ?2",
                params![self.account_id, room_id],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(StoreError::from)
        })?;

        let Some((pickled, max_messages, message_count, max_age_ms, created_at, last_used)) = row
        else {
            return Ok(None);
        };
        Ok(Some(OutboundGroupSessionRecord {
            room_id: room_id.to_string(),
            session: self.unpickle(&pickled)?,
            max_age_ms,
            max_messages,
            message_count,
            created_at,
            last_used,
        }))
    }

    /// Drop the room's outbound session together with its shared-with record.
    pub fn remove_outbound_group_session(&self, room_id: &str) -> Result<(), StoreError> {
        self.db.with_transaction(TransactionBehavior::Immediate, |tx| {
            self.delete_outbound(tx, room_id)
        })
    }

    // ==================== Sharing Operations ====================

    pub fn mark_outbound_group_session_shared(
        &self,
        user_id: &str,
        identity_key: &PublicKey,
        session_id: &str,
    ) -> Result<(), StoreError> {
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO megolm_outbound_session_shared
                    (account_id, user_id, identity_key, session_id)
                 VALUES (?1, ?2, ?3, ?4) ON CONFLICT DO NOTHING",
                params![self.account_id, user_id, identity_key.to_base64(), session_id],
            )?;
            Ok(())
        })
    }

    pub fn is_outbound_group_session_shared(
        &self,
        user_id: &str,
        identity_key: &PublicKey,
        session_id: &str,
    ) -> Result<bool, StoreError> {
        self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM megolm_outbound_session_shared
                    WHERE account_id = ?1 AND user_id = ?2 AND identity_key = ?3
                      AND session_id = ?4
                 )",
                params![self.account_id, user_id, identity_key.to_base64(), session_id],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })
    }
}
