//! Inbound group session persistence, withheld notices and redaction.

use crypto::{Ed25519PublicKey, PublicKey};
use storage::{
    Connection, OptionalExtension, Row, ToSql, ToSqlOutput, TransactionBehavior, params,
};
use tracing::{debug, info};

use crate::{
    errors::StoreError,
    store::SessionStore,
    types::{
        GroupSessionState, InboundGroupSessionRecord, RatchetSafety, WithheldCode, WithheldInfo,
        WithheldNotice,
    },
    utils::timestamp_millis,
};

const TABLE: &str = "megolm_inbound_session";

const SELECT_INBOUND: &str = "
    SELECT room_id, session_id, sender_key, signing_key, session, forwarding_chains,
           ratchet_safety, received_at, max_age, max_messages, is_scheduled,
           withheld_code, withheld_reason, key_backup_version
    FROM megolm_inbound_session
";

const REDACTED_PREFIX: &str = "Session redacted: ";

/// The raw columns of one inbound group session row.
struct InboundRow {
    room_id: String,
    session_id: String,
    sender_key: String,
    signing_key: Option<String>,
    session: Option<Vec<u8>>,
    forwarding_chains: Option<String>,
    ratchet_safety: Option<String>,
    received_at: Option<i64>,
    max_age: Option<i64>,
    max_messages: Option<u32>,
    is_scheduled: bool,
    withheld_code: Option<String>,
    withheld_reason: Option<String>,
    key_backup_version: String,
}

impl InboundRow {
    fn from_row(row: &Row<'_>) -> Result<Self, storage::RusqliteError> {
        Ok(Self {
            room_id: row.get(0)?,
            session_id: row.get(1)?,
            sender_key: row.get(2)?,
            signing_key: row.get(3)?,
            session: row.get(4)?,
            forwarding_chains: row.get(5)?,
            ratchet_safety: row.get(6)?,
            received_at: row.get(7)?,
            max_age: row.get(8)?,
            max_messages: row.get(9)?,
            is_scheduled: row.get(10)?,
            withheld_code: row.get(11)?,
            withheld_reason: row.get(12)?,
            key_backup_version: row.get(13)?,
        })
    }
}

fn split_chains(joined: Option<String>) -> Vec<String> {
    match joined {
        Some(joined) if !joined.is_empty() => joined.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

impl SessionStore {
    fn record_from_row(&self, row: InboundRow) -> Result<InboundGroupSessionRecord, StoreError> {
        let state = match (row.session, row.withheld_code) {
            (Some(pickled), None) => GroupSessionState::Active(self.unpickle(&pickled)?),
            (None, Some(code)) => GroupSessionState::Withheld(WithheldInfo {
                code: WithheldCode::from(code.as_str()),
                reason: row.withheld_reason.unwrap_or_default(),
            }),
            _ => return Err(StoreError::corrupt(TABLE, "session and withheld code both set or both empty")),
        };
        let sender_key = PublicKey::from_base64(&row.sender_key)
            .map_err(|e| StoreError::corrupt(TABLE, e.to_string()))?;
        let signing_key = row
            .signing_key
            .as_deref()
            .map(Ed25519PublicKey::from_base64)
            .transpose()
            .map_err(|e| StoreError::corrupt(TABLE, e.to_string()))?;
        let ratchet_safety = match row.ratchet_safety.as_deref() {
            Some(json) if !json.is_empty() => serde_json::from_str(json)?,
            _ => RatchetSafety::default(),
        };

        Ok(InboundGroupSessionRecord {
            room_id: row.room_id,
            session_id: row.session_id,
            sender_key,
            signing_key,
            state,
            forwarding_chains: split_chains(row.forwarding_chains),
            ratchet_safety,
            received_at: row.received_at,
            max_age_ms: row.max_age,
            max_messages: row.max_messages,
            is_scheduled: row.is_scheduled,
            key_backup_version: row.key_backup_version,
        })
    }

    /// Insert or replace an inbound group session. Replacing clears any
    /// withheld marker left on the row.
    pub fn put_group_session(&self, record: &InboundGroupSessionRecord) -> Result<(), StoreError> {
        self.db
            .with_connection(|conn| self.upsert_group_session(conn, record))
    }

    /// The upsert behind [`SessionStore::put_group_session`], on a caller's
    /// connection or transaction.
    pub(crate) fn upsert_group_session(
        &self,
        conn: &Connection,
        record: &InboundGroupSessionRecord,
    ) -> Result<(), StoreError> {
        let GroupSessionState::Active(session) = &record.state else {
            return Err(StoreError::InvalidArgument(
                "withheld sessions are stored with put_withheld_group_session",
            ));
        };
        let pickled = self.pickle(session)?;
        let ratchet_safety = serde_json::to_string(&record.ratchet_safety)?;
        let signing_key = record.signing_key.unwrap_or(session.signing_key());

        debug!(
            session_id = %record.session_id,
            room_id = %record.room_id,
            sender_key = %record.sender_key,
            received_at = ?record.received_at,
            is_scheduled = record.is_scheduled,
            "upserting inbound group session"
        );
        conn.execute(
            "INSERT INTO megolm_inbound_session (
                account_id, session_id, sender_key, signing_key, room_id, session,
                forwarding_chains, ratchet_safety, received_at, max_age, max_messages,
                is_scheduled, key_backup_version
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT (account_id, session_id) DO UPDATE SET
                withheld_code = NULL,
                withheld_reason = NULL,
                sender_key = excluded.sender_key,
                signing_key = excluded.signing_key,
                room_id = excluded.room_id,
                session = excluded.session,
                forwarding_chains = excluded.forwarding_chains,
                ratchet_safety = excluded.ratchet_safety,
                received_at = excluded.received_at,
                max_age = excluded.max_age,
                max_messages = excluded.max_messages,
                is_scheduled = excluded.is_scheduled,
                key_backup_version = excluded.key_backup_version",
            params![
                self.account_id,
                record.session_id,
                record.sender_key.to_base64(),
                signing_key.to_base64(),
                record.room_id,
                pickled,
                record.forwarding_chains.join(","),
                ratchet_safety,
                record.received_at,
                record.max_age_ms,
                record.max_messages,
                record.is_scheduled,
                record.key_backup_version,
            ],
        )?;
        Ok(())
    }

    /// The stored row for `session_id` in `room_id`, active or withheld.
    pub fn get_group_session(
        &self,
        room_id: &str,
        session_id: &str,
    ) -> Result<Option<InboundGroupSessionRecord>, StoreError> {
        let row = self.db.with_connection(|conn| {
            conn.query_row(
                &format!("{SELECT_INBOUND} WHERE room_id = ?1 AND session_id = ?2 AND account_id = ?3"),
                params![room_id, session_id, self.account_id],
                InboundRow::from_row,
            )
            .optional()
            .map_err(StoreError::from)
        })?;
        row.map(|row| self.record_from_row(row)).transpose()
    }

    /// Every active session in `room_id`.
    pub fn get_group_sessions_for_room(
        &self,
        room_id: &str,
    ) -> Result<Vec<InboundGroupSessionRecord>, StoreError> {
        let rows = self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_INBOUND} WHERE room_id = ?1 AND account_id = ?2 AND session IS NOT NULL"
            ))?;
            let rows = stmt.query_map(params![room_id, self.account_id], InboundRow::from_row)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })?;
        rows.into_iter().map(|row| self.record_from_row(row)).collect()
    }

    /// Record a decrypt at `index` in the session's index bookkeeping. The
    /// row is re-read and written back in one immediate transaction, so
    /// concurrent decrypts of the same session all land. Returns the updated
    /// bookkeeping, or `None` if the session is gone or no longer active.
    pub fn record_ratchet_safety(
        &self,
        session_id: &str,
        index: u32,
        first_known: u32,
    ) -> Result<Option<RatchetSafety>, StoreError> {
        self.db
            .with_transaction(TransactionBehavior::Immediate, |tx| {
                let stored: Option<Option<String>> = tx
                    .query_row(
                        "SELECT ratchet_safety FROM megolm_inbound_session
                         WHERE account_id = ?1 AND session_id = ?2 AND session IS NOT NULL",
                        params![self.account_id, session_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(stored) = stored else {
                    return Ok(None);
                };
                let mut safety: RatchetSafety = match stored.as_deref() {
                    Some(json) if !json.is_empty() => serde_json::from_str(json)?,
                    _ => RatchetSafety::default(),
                };
                if safety.record(index, first_known) {
                    tx.execute(
                        "UPDATE megolm_inbound_session SET ratchet_safety = ?1
                         WHERE account_id = ?2 AND session_id = ?3",
                        params![serde_json::to_string(&safety)?, self.account_id, session_id],
                    )?;
                }
                Ok(Some(safety))
            })
    }

    // ==================== Withheld Operations ====================

    /// Record a withheld notice. An existing row for the session, active or
    /// withheld, is left alone.
    pub fn put_withheld_group_session(&self, notice: &WithheldNotice) -> Result<(), StoreError> {
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO megolm_inbound_session
                    (account_id, session_id, sender_key, room_id, withheld_code, withheld_reason, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (account_id, session_id) DO NOTHING",
                params![
                    self.account_id,
                    notice.session_id,
                    notice.sender_key.to_base64(),
                    notice.room_id,
                    notice.code.as_str(),
                    notice.reason,
                    timestamp_millis(),
                ],
            )?;
            Ok(())
        })
    }

    /// The withheld notice for a session, if the row is withheld.
    pub fn get_withheld_group_session(
        &self,
        room_id: &str,
        session_id: &str,
    ) -> Result<Option<WithheldNotice>, StoreError> {
        let Some(record) = self.get_group_session(room_id, session_id)? else {
            return Ok(None);
        };
        Ok(match record.state {
            GroupSessionState::Withheld(info) => Some(WithheldNotice {
                room_id: record.room_id,
                session_id: record.session_id,
                sender_key: record.sender_key,
                code: info.code,
                reason: info.reason,
            }),
            GroupSessionState::Active(_) => None,
        })
    }

    // ==================== Redaction Operations ====================

    fn redact_matching(
        &self,
        filter: &str,
        reason: &str,
        extra: &[&dyn ToSql],
    ) -> Result<Vec<String>, StoreError> {
        let code = WithheldCode::Redacted;
        let reason = format!("{REDACTED_PREFIX}{reason}");
        let mut args: Vec<&dyn ToSql> = vec![&code as &dyn ToSql, &reason, &self.account_id];
        args.extend_from_slice(extra);

        let redacted = self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "UPDATE megolm_inbound_session
                 SET withheld_code = ?1, withheld_reason = ?2, session = NULL, forwarding_chains = NULL
                 WHERE account_id = ?3 AND session IS NOT NULL AND {filter}
                 RETURNING session_id"
            ))?;
            let rows = stmt.query_map(&*args, |row| row.get(0))?;
            rows.collect::<Result<Vec<String>, _>>()
                .map_err(StoreError::from)
        })?;
        if !redacted.is_empty() {
            info!(count = redacted.len(), reason = %reason, "redacted inbound group sessions");
        }
        Ok(redacted)
    }

    /// Destroy one session's ratchet, leaving a redaction marker. Returns
    /// whether anything was redacted.
    pub fn redact_group_session(&self, session_id: &str, reason: &str) -> Result<bool, StoreError> {
        let redacted = self.redact_matching("session_id = ?4", reason, &[&session_id])?;
        Ok(!redacted.is_empty())
    }

    /// Redact every received session in `room_id` and/or from `sender_key`.
    /// Scheduled sessions and sessions without a receipt time are skipped.
    pub fn redact_group_sessions(
        &self,
        room_id: Option<&str>,
        sender_key: Option<&PublicKey>,
        reason: &str,
    ) -> Result<Vec<String>, StoreError> {
        if room_id.is_none() && sender_key.is_none() {
            return Err(StoreError::InvalidArgument(
                "room ID or sender key must be provided for redacting sessions",
            ));
        }
        let room_id = room_id.unwrap_or_default();
        let sender_key = sender_key.map(PublicKey::to_base64).unwrap_or_default();
        self.redact_matching(
            "(room_id = ?4 OR ?4 = '') AND (sender_key = ?5 OR ?5 = '')
             AND is_scheduled = 0 AND received_at IS NOT NULL",
            reason,
            &[&room_id, &sender_key],
        )
    }

    /// Redact sessions received more than twice their max age ago.
    pub fn redact_expired_group_sessions(&self) -> Result<Vec<String>, StoreError> {
        let now = timestamp_millis();
        self.redact_matching(
            "is_scheduled = 0 AND received_at IS NOT NULL AND max_age IS NOT NULL
             AND received_at + 2 * max_age < ?4",
            "expired",
            &[&now],
        )
    }

    /// Redact sessions with no receipt time, which predate its tracking.
    pub fn redact_outdated_group_sessions(&self) -> Result<Vec<String>, StoreError> {
        self.redact_matching("received_at IS NULL", "outdated", &[])
    }
}

impl ToSql for WithheldCode {
    fn to_sql(&self) -> Result<ToSqlOutput<'_>, storage::RusqliteError> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}
