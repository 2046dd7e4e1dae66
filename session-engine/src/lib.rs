//! End-to-end encryption engine for pairwise and group sessions.
//!
//! [`SessionEngine`] ties the ratchets in `double_ratchets` to the durable
//! [`session_store::SessionStore`]: it opens and persists pairwise channels,
//! rotates and shares room keys, installs received keys and decrypts room
//! events with replay protection. Failures that more key material could fix
//! are queued on the [`RetryQueue`].

pub mod compat;
pub mod config;
pub mod cross_signing;
pub mod engine;
pub mod errors;
pub mod retry;
pub mod sync;

pub use config::{EngineConfig, GroupSessionPolicy};
pub use cross_signing::{
    CrossSigningKey, CrossSigningKeys, CrossSigningPublicKeys, CrossSigningSeeds,
    CrossSigningUpload,
};
pub use engine::{PruneReport, RemoteDevice, SessionEngine};
pub use errors::{ConfigError, EngineError, ErrorKind};
pub use retry::{RetryQueue, SessionRequest};
pub use sync::{
    BatchFailure, BatchOutcome, DecryptedRoomEvent, EncryptedGroupMessage, EncryptedRoomEvent,
    MEGOLM_ALGORITHM, RoomKeyContent, ToDeviceEvent, ToDeviceMessage, ToDevicePayload,
};
