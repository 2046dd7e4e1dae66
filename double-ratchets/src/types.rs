pub type RootKey = [u8; 32];
pub type ChainKey = [u8; 32];
pub type MessageKey = [u8; 32];
pub type SharedSecret = [u8; 32];

pub type AeadKey = [u8; 32];
pub type Nonce = [u8; 12];

/// Size of the Poly1305 tag appended to every sealed payload.
pub const TAG_LEN: usize = 16;
