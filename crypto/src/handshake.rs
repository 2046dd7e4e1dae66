use crate::keys::{PrivateKey, PublicKey, SymmetricKey};

/// Concatenated output of the three Diffie-Hellman operations. Callers pass
/// it through a KDF before use; it is never a key on its own.
pub type HandshakeSecret = SymmetricKey<96>;

/// Triple Diffie-Hellman agreement used to open a pairwise session.
///
/// The initiator contributes its identity key `I_a` and a fresh ephemeral
/// (base) key `E_a`. The responder contributes its identity key `I_b` and one
/// of its published one-time keys `O_b`. Both sides compute
/// `DH(I_a, O_b) ‖ DH(E_a, I_b) ‖ DH(E_a, O_b)`.
pub struct TripleDh;

impl TripleDh {
    /// Perform the agreement as the session initiator
    ///
    /// # Arguments
    /// * `identity` - Initiator's long-term identity key
    /// * `ephemeral` - Initiator's base key, generated for this session only
    /// * `remote_identity` - Responder's identity public key
    /// * `remote_one_time` - Responder's claimed one-time public key
    pub fn initiator(
        identity: &PrivateKey,
        ephemeral: &PrivateKey,
        remote_identity: &PublicKey,
        remote_one_time: &PublicKey,
    ) -> HandshakeSecret {
        let dh1 = identity.diffie_hellman(remote_one_time);
        let dh2 = ephemeral.diffie_hellman(remote_identity);
        let dh3 = ephemeral.diffie_hellman(remote_one_time);
        Self::concat(&[dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes()])
    }

    /// Perform the agreement as the session responder
    ///
    /// # Arguments
    /// * `identity` - Responder's long-term identity key
    /// * `one_time` - The one-time key the initiator claimed
    /// * `remote_identity` - Initiator's identity public key
    /// * `remote_ephemeral` - Initiator's base key
    pub fn responder(
        identity: &PrivateKey,
        one_time: &PrivateKey,
        remote_identity: &PublicKey,
        remote_ephemeral: &PublicKey,
    ) -> HandshakeSecret {
        let dh1 = one_time.diffie_hellman(remote_identity);
        let dh2 = identity.diffie_hellman(remote_ephemeral);
        let dh3 = one_time.diffie_hellman(remote_ephemeral);
        Self::concat(&[dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes()])
    }

    fn concat(parts: &[&[u8; 32]; 3]) -> HandshakeSecret {
        let mut out = [0u8; 96];
        for (chunk, part) in out.chunks_exact_mut(32).zip(parts) {
            chunk.copy_from_slice(*part);
        }
        HandshakeSecret::from(out)
    }
}
