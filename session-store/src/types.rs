//! Record types held by the session store.

use std::fmt;

use crypto::{Ed25519PublicKey, PublicKey};
use double_ratchets::{InboundGroupSession, OutboundGroupSession, PairwiseSession};
use serde::{Deserialize, Serialize};

/// Missed indices further than this behind the newest one are not tracked.
const MAX_TRACKED_GAP: u32 = 1000;

/// A pairwise session together with its usage timestamps (unix millis).
#[derive(Clone)]
pub struct DeviceSession {
    pub session: PairwiseSession,
    pub created_at: i64,
    pub last_encrypted: i64,
    pub last_decrypted: i64,
}

impl DeviceSession {
    pub fn new(session: PairwiseSession, now: i64) -> Self {
        Self {
            session,
            created_at: now,
            last_encrypted: now,
            last_decrypted: now,
        }
    }

    pub fn session_id(&self) -> &str {
        self.session.session_id()
    }
}

/// Orders sessions most-recently-useful first: newest successful decrypt,
/// then newest creation.
pub(crate) fn sort_by_usefulness(sessions: &mut [DeviceSession]) {
    sessions.sort_by(|a, b| {
        b.last_decrypted
            .cmp(&a.last_decrypted)
            .then(b.created_at.cmp(&a.created_at))
    });
}

/// Reason codes attached to withheld or redacted group sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WithheldCode {
    Blacklisted,
    Unverified,
    Unauthorised,
    Unavailable,
    NoOlm,
    /// Set locally when a stored session is destroyed.
    Redacted,
    Other(String),
}

impl WithheldCode {
    pub fn as_str(&self) -> &str {
        match self {
            WithheldCode::Blacklisted => "m.blacklisted",
            WithheldCode::Unverified => "m.unverified",
            WithheldCode::Unauthorised => "m.unauthorised",
            WithheldCode::Unavailable => "m.unavailable",
            WithheldCode::NoOlm => "m.no_olm",
            WithheldCode::Redacted => "com.beeper.redacted",
            WithheldCode::Other(code) => code,
        }
    }
}

impl From<&str> for WithheldCode {
    fn from(value: &str) -> Self {
        match value {
            "m.blacklisted" => WithheldCode::Blacklisted,
            "m.unverified" => WithheldCode::Unverified,
            "m.unauthorised" => WithheldCode::Unauthorised,
            "m.unavailable" => WithheldCode::Unavailable,
            "m.no_olm" => WithheldCode::NoOlm,
            "com.beeper.redacted" => WithheldCode::Redacted,
            other => WithheldCode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for WithheldCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithheldInfo {
    pub code: WithheldCode,
    pub reason: String,
}

/// A sender's notice that it will not share a group session with us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithheldNotice {
    pub room_id: String,
    pub session_id: String,
    pub sender_key: PublicKey,
    pub code: WithheldCode,
    pub reason: String,
}

/// Either the ratchet or the reason we do not have it, never both.
#[derive(Clone)]
pub enum GroupSessionState {
    Active(InboundGroupSession),
    Withheld(WithheldInfo),
}

impl GroupSessionState {
    pub fn session(&self) -> Option<&InboundGroupSession> {
        match self {
            GroupSessionState::Active(session) => Some(session),
            GroupSessionState::Withheld(_) => None,
        }
    }

    pub fn withheld(&self) -> Option<&WithheldInfo> {
        match self {
            GroupSessionState::Active(_) => None,
            GroupSessionState::Withheld(info) => Some(info),
        }
    }
}

/// Which indices of a group session have been seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetSafety {
    pub next_index: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missed_indices: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lost_indices: Vec<u32>,
}

impl RatchetSafety {
    /// Record a successful decrypt at `index`. Indices below `first_known`
    /// can no longer be decrypted and move from missed to lost. Returns
    /// whether anything changed.
    pub fn record(&mut self, index: u32, first_known: u32) -> bool {
        let before = self.clone();

        if index >= self.next_index {
            let start = self.next_index.max(index.saturating_sub(MAX_TRACKED_GAP));
            self.missed_indices.extend(start..index);
            self.next_index = index.saturating_add(1);
        } else {
            self.missed_indices.retain(|&missed| missed != index);
        }

        let (lost, missed): (Vec<u32>, Vec<u32>) = self
            .missed_indices
            .iter()
            .partition(|&&missed| missed < first_known);
        self.missed_indices = missed;
        self.lost_indices.extend(lost);

        *self != before
    }
}

/// A received group session and the metadata kept alongside it.
#[derive(Clone)]
pub struct InboundGroupSessionRecord {
    pub room_id: String,
    pub session_id: String,
    pub sender_key: PublicKey,
    /// Absent on rows created from a withheld notice.
    pub signing_key: Option<Ed25519PublicKey>,
    pub state: GroupSessionState,
    pub forwarding_chains: Vec<String>,
    pub ratchet_safety: RatchetSafety,
    pub received_at: Option<i64>,
    pub max_age_ms: Option<i64>,
    pub max_messages: Option<u32>,
    pub is_scheduled: bool,
    pub key_backup_version: String,
}

impl InboundGroupSessionRecord {
    /// A freshly received session in `room_id` from `sender_key`.
    pub fn new(
        room_id: impl Into<String>,
        sender_key: PublicKey,
        session: InboundGroupSession,
        received_at: i64,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            session_id: session.session_id(),
            sender_key,
            signing_key: Some(session.signing_key()),
            state: GroupSessionState::Active(session),
            forwarding_chains: Vec::new(),
            ratchet_safety: RatchetSafety::default(),
            received_at: Some(received_at),
            max_age_ms: None,
            max_messages: None,
            is_scheduled: false,
            key_backup_version: String::new(),
        }
    }

    pub fn session(&self) -> Option<&InboundGroupSession> {
        self.state.session()
    }
}

/// The room's current sending session and its rotation policy.
#[derive(Clone)]
pub struct OutboundGroupSessionRecord {
    pub room_id: String,
    pub session: OutboundGroupSession,
    pub max_age_ms: i64,
    pub max_messages: u32,
    pub message_count: u32,
    pub created_at: i64,
    pub last_used: i64,
}

impl OutboundGroupSessionRecord {
    pub fn new(
        room_id: impl Into<String>,
        session: OutboundGroupSession,
        max_age_ms: i64,
        max_messages: u32,
        now: i64,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            session,
            max_age_ms,
            max_messages,
            message_count: 0,
            created_at: now,
            last_used: now,
        }
    }

    pub fn session_id(&self) -> String {
        self.session.session_id()
    }

    /// True once the session is too old or has sent too many messages.
    pub fn is_expired(&self, now: i64) -> bool {
        self.message_count >= self.max_messages
            || self.created_at.saturating_add(self.max_age_ms) < now
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_ratchet_safety_tracks_gaps() {
        let mut safety = RatchetSafety::default();

        assert!(safety.record(0, 0));
        assert!(safety.record(3, 0));
        assert_eq!(safety.next_index, 4);
        assert_eq!(safety.missed_indices, vec![1, 2]);

        assert!(safety.record(2, 0));
        assert_eq!(safety.missed_indices, vec![1]);

        assert!(!safety.record(2, 0));
    }

    #[test]
    fn test_ratchet_safety_marks_unreachable_indices_lost() {
        let mut safety = RatchetSafety::default();
        safety.record(5, 0);
        assert_eq!(safety.missed_indices, vec![0, 1, 2, 3, 4]);

        safety.record(6, 3);
        assert_eq!(safety.missed_indices, vec![3, 4]);
        assert_eq!(safety.lost_indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_ratchet_safety_bounds_large_jumps() {
        let mut safety = RatchetSafety::default();
        safety.record(u32::MAX - 1, 0);
        assert_eq!(safety.missed_indices.len(), MAX_TRACKED_GAP as usize);
        assert_eq!(safety.next_index, u32::MAX);
    }

    proptest! {
        #[test]
        fn test_ratchet_safety_missed_is_complement_of_seen(
            indices in prop::collection::vec(0u32..500, 1..40),
        ) {
            let mut safety = RatchetSafety::default();
            for &index in &indices {
                safety.record(index, 0);
            }
            let seen: BTreeSet<u32> = indices.iter().copied().collect();
            let highest = *seen.iter().next_back().unwrap();
            let expected: BTreeSet<u32> = (0..highest).filter(|i| !seen.contains(i)).collect();
            let missed: BTreeSet<u32> = safety.missed_indices.iter().copied().collect();

            prop_assert_eq!(safety.next_index, highest + 1);
            prop_assert_eq!(missed, expected);
            prop_assert!(safety.lost_indices.is_empty());
        }
    }

    #[test]
    fn test_ratchet_safety_json_shape() {
        let safety = RatchetSafety {
            next_index: 2,
            missed_indices: vec![0],
            lost_indices: vec![],
        };
        let json = serde_json::to_string(&safety).unwrap();
        assert_eq!(json, r#"{"next_index":2,"missed_indices":[0]}"#);
        assert_eq!(serde_json::from_str::<RatchetSafety>(&json).unwrap(), safety);
    }

    #[test]
    fn test_withheld_codes_roundtrip_through_text() {
        for code in [
            WithheldCode::Blacklisted,
            WithheldCode::Unavailable,
            WithheldCode::Redacted,
            WithheldCode::Other("org.example.custom".into()),
        ] {
            assert_eq!(WithheldCode::from(code.as_str()), code);
        }
    }
}
