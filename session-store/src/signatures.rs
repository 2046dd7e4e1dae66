//! Signatures over cross-signing and device keys.

use std::collections::HashMap;

use crypto::{Ed25519PublicKey, Ed25519Signature};
use storage::params;

use crate::{errors::StoreError, store::SessionStore};

impl SessionStore {
    /// Record that `signer_key` of `signer_user_id` signed `signed_key` of
    /// `signed_user_id`. A newer signature for the same pair replaces the
    /// older one.
    pub fn put_signature(
        &self,
        signed_user_id: &str,
        signed_key: &Ed25519PublicKey,
        signer_user_id: &str,
        signer_key: &Ed25519PublicKey,
        signature: &Ed25519Signature,
    ) -> Result<(), StoreError> {
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO cross_signing_signatures
                    (signed_user_id, signed_key, signer_user_id, signer_key, signature)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (signed_user_id, signed_key, signer_user_id, signer_key)
                 DO UPDATE SET signature = excluded.signature",
                params![
                    signed_user_id,
                    signed_key.to_base64(),
                    signer_user_id,
                    signer_key.to_base64(),
                    signature.to_base64(),
                ],
            )?;
            Ok(())
        })
    }

    /// Signatures on `key` made by any key of `signer_user_id`, keyed by the
    /// signing key.
    pub fn get_signatures_for_key_by(
        &self,
        user_id: &str,
        key: &Ed25519PublicKey,
        signer_user_id: &str,
    ) -> Result<HashMap<String, String>, StoreError> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT signer_key, signature FROM cross_signing_signatures
                 WHERE signed_user_id = ?1 AND signed_key = ?2 AND signer_user_id = ?3",
            )?;
            let rows = stmt.query_map(params![user_id, key.to_base64(), signer_user_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<Result<HashMap<_, _>, _>>()
                .map_err(StoreError::from)
        })
    }

    pub fn is_key_signed_by(
        &self,
        signed_user_id: &str,
        signed_key: &Ed25519PublicKey,
        signer_user_id: &str,
        signer_key: &Ed25519PublicKey,
    ) -> Result<bool, StoreError> {
        self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM cross_signing_signatures
                    WHERE signed_user_id = ?1 AND signed_key = ?2
                      AND signer_user_id = ?3 AND signer_key = ?4
                 )",
                params![
                    signed_user_id,
                    signed_key.to_base64(),
                    signer_user_id,
                    signer_key.to_base64(),
                ],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{backend, test_store};

    #[test]
    fn test_signature_records() {
        let store = test_store();
        let signer = backend().generate_identity().unwrap();
        let signed = backend().generate_identity().unwrap().signing_key();
        let signature = signer.sign(backend(), b"canonical json").unwrap();

        let user = "@alice:example.org";
        assert!(!store.is_key_signed_by(user, &signed, user, &signer.signing_key()).unwrap());

        store
            .put_signature(user, &signed, user, &signer.signing_key(), &signature)
            .unwrap();
        assert!(store.is_key_signed_by(user, &signed, user, &signer.signing_key()).unwrap());
        assert!(!store.is_key_signed_by(user, &signed, "@eve:example.org", &signer.signing_key()).unwrap());

        let all = store.get_signatures_for_key_by(user, &signed, user).unwrap();
        assert_eq!(all.get(&signer.signing_key().to_base64()), Some(&signature.to_base64()));
    }
}
