//! Replay protection for group messages.
//!
//! Every (sender key, session, message index) triple is bound to the first
//! event that used it. A later event reusing the triple is a replay.

use std::sync::Arc;

use storage::{SqliteDb, TransactionBehavior, params};
use tracing::warn;

use crate::errors::StoreError;

pub struct ReplayGuard {
    db: Arc<SqliteDb>,
}

impl ReplayGuard {
    pub fn new(db: Arc<SqliteDb>) -> Self {
        Self { db }
    }

    /// Bind `index` to `event_id`/`timestamp` if unbound, then report
    /// whether the stored binding matches. The insert and the re-read run
    /// in one immediate transaction.
    pub fn validate_message_index(
        &self,
        sender_key: &str,
        session_id: &str,
        index: u32,
        event_id: &str,
        timestamp: i64,
    ) -> Result<bool, StoreError> {
        let (expected_event_id, expected_timestamp) =
            self.db
                .with_transaction(TransactionBehavior::Immediate, |tx| {
                    tx.execute(
                        "INSERT INTO message_index (sender_key, session_id, idx, event_id, timestamp)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT (sender_key, session_id, idx) DO NOTHING",
                        params![sender_key, session_id, index, event_id, timestamp],
                    )?;
                    tx.query_row(
                        "SELECT event_id, timestamp FROM message_index
                         WHERE sender_key = ?1 AND session_id = ?2 AND idx = ?3",
                        params![sender_key, session_id, index],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                    )
                    .map_err(StoreError::from)
                })?;

        if expected_event_id != event_id || expected_timestamp != timestamp {
            warn!(
                sender_key,
                session_id,
                index,
                expected_event_id = %expected_event_id,
                expected_timestamp,
                actual_event_id = event_id,
                actual_timestamp = timestamp,
                "rejecting different event with duplicate message index"
            );
            return Ok(false);
        }
        Ok(true)
    }
}
