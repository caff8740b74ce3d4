//! X3DH (Extended Triple Diffie-Hellman) Key Agreement Protocol
//!
//! Establishes the root secret of a ratchet session from a published
//! prekey bundle. The responder side takes the private halves of the
//! long-term and (optional) one-time prekey that the initiator named.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::keys::{IdentityKeyPair, KeyError, KeyId, PreKeyBundle, PreKeyPair};

/// Info string for HKDF
const X3DH_INFO: &[u8] = b"RatchetCore_X3DH";

/// X3DH session result
pub struct X3DHSession {
    /// Shared secret (32 bytes)
    shared_secret: [u8; 32],
    /// Associated data for AEAD (IK_initiator || IK_responder)
    pub associated_data: Vec<u8>,
    /// Initiator's ephemeral public key
    pub ephemeral_public: X25519PublicKey,
    /// Id of the long-term prekey the agreement used
    pub long_term_key_id: KeyId,
    /// Id of the consumed one-time prekey (if any)
    pub one_time_key_id: Option<KeyId>,
}

impl X3DHSession {
    /// Get the shared secret
    pub fn shared_secret(&self) -> &[u8; 32] {
        &self.shared_secret
    }
}

impl Drop for X3DHSession {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

/// X3DH errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum X3DHError {
    #[error("Invalid prekey bundle signature")]
    InvalidSignature,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

impl From<KeyError> for X3DHError {
    fn from(_: KeyError) -> Self {
        X3DHError::InvalidSignature
    }
}

/// X3DH key agreement
pub struct X3DH;

impl X3DH {
    /// Initiator runs X3DH against the responder's prekey bundle
    pub fn initiate(
        initiator_identity: &IdentityKeyPair,
        bundle: &PreKeyBundle,
    ) -> Result<X3DHSession, X3DHError> {
        bundle.verify()?;

        let ephemeral_private = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = X25519PublicKey::from(&ephemeral_private);
        let responder_identity = bundle.identity_key();

        // DH1 = DH(IK_A, SPK_B)
        let dh1 = initiator_identity
            .private_key()
            .diffie_hellman(&bundle.signed_prekey);
        // DH2 = DH(EK_A, IK_B)
        let dh2 = ephemeral_private.diffie_hellman(&responder_identity);
        // DH3 = DH(EK_A, SPK_B)
        let dh3 = ephemeral_private.diffie_hellman(&bundle.signed_prekey);
        // DH4 = DH(EK_A, OPK_B)
        let dh4 = bundle
            .one_time_prekey
            .as_ref()
            .map(|opk| ephemeral_private.diffie_hellman(opk));

        let mut dh_concat = Zeroizing::new(Vec::with_capacity(128));
        dh_concat.extend_from_slice(dh1.as_bytes());
        dh_concat.extend_from_slice(dh2.as_bytes());
        dh_concat.extend_from_slice(dh3.as_bytes());
        if let Some(ref dh4) = dh4 {
            dh_concat.extend_from_slice(dh4.as_bytes());
        }

        let shared_secret = Self::kdf(&dh_concat)?;

        let mut associated_data = Vec::with_capacity(64);
        associated_data.extend_from_slice(initiator_identity.public_key().as_bytes());
        associated_data.extend_from_slice(responder_identity.as_bytes());

        Ok(X3DHSession {
            shared_secret,
            associated_data,
            ephemeral_public,
            long_term_key_id: bundle.signed_prekey_id(),
            one_time_key_id: bundle.one_time_prekey_id(),
        })
    }

    /// Responder completes X3DH from the initiator's identity and ephemeral keys
    pub fn respond(
        responder_identity: &IdentityKeyPair,
        long_term_prekey: &PreKeyPair,
        one_time_prekey: Option<&PreKeyPair>,
        initiator_identity_key: &X25519PublicKey,
        initiator_ephemeral_key: &X25519PublicKey,
    ) -> Result<X3DHSession, X3DHError> {
        // Same DH values as the initiator with roles reversed
        let dh1 = long_term_prekey
            .private_key()
            .diffie_hellman(initiator_identity_key);
        let dh2 = responder_identity
            .private_key()
            .diffie_hellman(initiator_ephemeral_key);
        let dh3 = long_term_prekey
            .private_key()
            .diffie_hellman(initiator_ephemeral_key);
        let dh4 = one_time_prekey.map(|opk| opk.private_key().diffie_hellman(initiator_ephemeral_key));

        let mut dh_concat = Zeroizing::new(Vec::with_capacity(128));
        dh_concat.extend_from_slice(dh1.as_bytes());
        dh_concat.extend_from_slice(dh2.as_bytes());
        dh_concat.extend_from_slice(dh3.as_bytes());
        if let Some(ref dh4) = dh4 {
            dh_concat.extend_from_slice(dh4.as_bytes());
        }

        let shared_secret = Self::kdf(&dh_concat)?;

        let mut associated_data = Vec::with_capacity(64);
        associated_data.extend_from_slice(initiator_identity_key.as_bytes());
        associated_data.extend_from_slice(responder_identity.public_key().as_bytes());

        Ok(X3DHSession {
            shared_secret,
            associated_data,
            ephemeral_public: *initiator_ephemeral_key,
            long_term_key_id: long_term_prekey.key_id(),
            one_time_key_id: one_time_prekey.map(PreKeyPair::key_id),
        })
    }

    /// Key derivation function using HKDF-SHA256
    fn kdf(input: &[u8]) -> Result<[u8; 32], X3DHError> {
        // F = 0xFF * 32 prepended to the DH outputs
        let mut ikm = Zeroizing::new(vec![0xFFu8; 32]);
        ikm.extend_from_slice(input);

        let hk = Hkdf::<Sha256>::new(None, &ikm);
        let mut output = [0u8; 32];
        hk.expand(X3DH_INFO, &mut output)
            .map_err(|_| X3DHError::KeyDerivationFailed)?;

        Ok(output)
    }
}
