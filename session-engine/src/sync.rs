//! Event shapes crossing the engine boundary, and the accumulator threaded
//! through one batch of sync processing.

use crypto::PublicKey;
use double_ratchets::PairwiseCiphertext;
use serde::{Deserialize, Serialize};
use session_store::WithheldNotice;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::EngineError;

pub const MEGOLM_ALGORITHM: &str = "m.megolm.v1.aes-sha2";

/// A group session key handed to one device over a pairwise channel.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RoomKeyContent {
    pub algorithm: String,
    pub room_id: String,
    pub session_id: String,
    pub session_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_messages: Option<u32>,
}

/// Plaintext of a pairwise to-device message.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToDevicePayload {
    #[serde(rename = "m.room_key")]
    RoomKey(RoomKeyContent),
    /// Anything this engine does not consume.
    #[serde(other)]
    Unknown,
}

/// An inbound to-device event.
#[derive(Debug, Clone)]
pub enum ToDeviceEvent {
    Encrypted {
        sender_key: PublicKey,
        ciphertext: PairwiseCiphertext,
    },
    RoomKeyWithheld(WithheldNotice),
}

/// A pairwise message to deliver to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToDeviceMessage {
    pub user_id: String,
    pub device_id: String,
    pub sender_key: PublicKey,
    pub ciphertext: PairwiseCiphertext,
}

/// Output of `SessionEngine::encrypt_group`, ready to wrap in a room event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedGroupMessage {
    pub room_id: String,
    pub session_id: String,
    pub sender_key: PublicKey,
    pub ciphertext: Vec<u8>,
}

/// A group-encrypted room event as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedRoomEvent {
    pub room_id: String,
    pub event_id: String,
    pub sender_key: PublicKey,
    pub session_id: String,
    pub ciphertext: Vec<u8>,
    /// Origin timestamp, unix millis.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedRoomEvent {
    pub room_id: String,
    pub event_id: String,
    pub plaintext: Vec<u8>,
    pub message_index: u32,
    /// False when the session came from an unsigned import or forward.
    pub verified: bool,
    pub forwarding_chains: Vec<String>,
}

#[derive(Debug)]
pub struct BatchFailure {
    /// Event id, or sender key for to-device events.
    pub source: String,
    pub error: EngineError,
}

/// What one batch of sync processing did. Filled in by
/// `SessionEngine::handle_to_device_batch` and
/// `SessionEngine::decrypt_room_events`.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// The retry queue gained or widened a request.
    pub wakeup_request_queue: bool,
    pub installed_sessions: Vec<String>,
    pub withheld_sessions: Vec<String>,
    pub failures: Vec<BatchFailure>,
}

impl BatchOutcome {
    pub fn record_failure(&mut self, source: impl Into<String>, error: EngineError) {
        self.failures.push(BatchFailure {
            source: source.into(),
            error,
        });
    }

    pub fn is_empty(&self) -> bool {
        !self.wakeup_request_queue
            && self.installed_sessions.is_empty()
            && self.withheld_sessions.is_empty()
            && self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_key_payload_json() {
        let payload = ToDevicePayload::RoomKey(RoomKeyContent {
            algorithm: MEGOLM_ALGORITHM.into(),
            room_id: "!room:example.org".into(),
            session_id: "sid".into(),
            session_key: "key".into(),
            max_age_ms: None,
            max_messages: Some(10),
        });
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "m.room_key");
        assert_eq!(value["session_id"], "sid");
        assert_eq!(value["max_messages"], 10);
        assert!(value.get("max_age_ms").is_none());
    }

    #[test]
    fn test_unknown_payload_type_is_tolerated() {
        let parsed: ToDevicePayload =
            serde_json::from_str(r#"{"type":"m.dummy","extra":true}"#).unwrap();
        assert!(matches!(parsed, ToDevicePayload::Unknown));
    }

    #[test]
    fn test_outcome_tracks_failures() {
        let mut outcome = BatchOutcome::default();
        assert!(outcome.is_empty());
        outcome.record_failure("$event", EngineError::DuplicateMessage);
        assert!(!outcome.is_empty());
        assert_eq!(outcome.failures[0].source, "$event");
    }
}
