mod handshake;
mod keys;
mod signing;

pub use handshake::{HandshakeSecret, TripleDh};
pub use keys::{KeyError, PrivateKey, PublicKey, SymmetricKey, SymmetricKey32};
pub use signing::{Ed25519PublicKey, Ed25519Signature, SignatureError, SigningSeed};
