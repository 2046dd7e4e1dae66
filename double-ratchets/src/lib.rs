pub mod account;
pub mod aead;
pub mod backend;
pub mod errors;
pub mod group;
pub mod hkdf;
pub mod keypair;
pub mod pickle;
pub mod reader;
pub mod session;
pub mod state;
pub mod types;

pub use account::Account;
pub use backend::{BackendKind, NativeBackend, PortableBackend, RatchetBackend};
pub use errors::{PickleError, RatchetError};
pub use group::{
    ExportedRatchet, GroupPlaintext, InboundGroupSession, OutboundGroupSession, RATCHET_LEN,
    peek_message_index,
};
pub use keypair::InstallationKeyPair;
pub use pickle::Pickle;
pub use session::{MessageKind, PairwiseCiphertext, PairwiseSession};
pub use state::{Header, RatchetState};
