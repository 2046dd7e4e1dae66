//! Durable storage for end-to-end encryption sessions.
//!
//! [`SessionStore`] keeps the device account, pairwise sessions, inbound
//! and outbound group sessions and cross-signing signatures in one SQLite
//! database, with secrets sealed under a per-store pickle key.
//! [`ReplayGuard`] shares the database and binds group message indices to
//! the events that first used them.

mod errors;
mod group;
mod outbound;
mod pairwise;
mod replay;
mod signatures;
mod store;
mod types;
mod utils;

pub use errors::StoreError;
pub use replay::ReplayGuard;
pub use store::SessionStore;
pub use types::{
    DeviceSession, GroupSessionState, InboundGroupSessionRecord, OutboundGroupSessionRecord,
    RatchetSafety, WithheldCode, WithheldInfo, WithheldNotice,
};
pub use utils::timestamp_millis;

pub use storage::StorageConfig;
