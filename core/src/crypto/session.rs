//! Session management for encrypted communications
//!
//! Combines X3DH and Double Ratchet into the session handle the chat layer
//! persists per peer. Until the initiator has decrypted a reply, every
//! message it sends carries the prekey header, so the responder can build
//! its side of the session from whichever message arrives first.

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey as X25519PublicKey;
use zeroize::Zeroizing;

use crate::crypto::keys::{identity_exchange_key, IdentityKeyPair, KeyId, PreKeyBundle, PreKeyPair};
use crate::crypto::ratchet::{DoubleRatchet, EncryptedPayload, RatchetError};
use crate::crypto::x3dh::{X3DHError, X3DH};
use crate::util::serde_hex;

/// Key material the responder needs to complete X3DH
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrekeyHeader {
    /// Initiator's ephemeral key
    #[serde(with = "serde_hex::x25519")]
    pub ephemeral_key: X25519PublicKey,
    /// Responder's long-term prekey the initiator used
    pub long_term_key_id: KeyId,
    /// Responder's one-time prekey the initiator consumed (if any)
    pub one_time_key_id: Option<KeyId>,
}

/// Wire message produced by `SecureSession::encrypt`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    pub prekey: Option<PrekeyHeader>,
    pub payload: EncryptedPayload,
}

impl RatchetMessage {
    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, SessionError> {
        serde_json::to_vec(self).map_err(|_| SessionError::Serialization)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionError> {
        serde_json::from_slice(bytes).map_err(|_| SessionError::Serialization)
    }

    /// Whether this message can start a session on the receiving side
    pub fn is_prekey_message(&self) -> bool {
        self.prekey.is_some()
    }

    pub fn long_term_key_id(&self) -> Option<KeyId> {
        self.prekey.as_ref().map(|p| p.long_term_key_id)
    }

    pub fn one_time_key_id(&self) -> Option<KeyId> {
        self.prekey.as_ref().and_then(|p| p.one_time_key_id)
    }
}

/// A secure messaging session with a peer
#[derive(Clone, Serialize, Deserialize)]
pub struct SecureSession {
    /// Peer identity this session is stored under
    participant_identity: String,
    ratchet: DoubleRatchet,
    /// Attached to outgoing messages until the first reply is decrypted
    pending_prekey: Option<PrekeyHeader>,
}

impl SecureSession {
    /// Create a new session as the initiator
    pub fn initiate(
        participant_identity: impl Into<String>,
        local_identity: &IdentityKeyPair,
        remote_bundle: &PreKeyBundle,
    ) -> Result<Self, SessionError> {
        let x3dh = X3DH::initiate(local_identity, remote_bundle)?;

        let ratchet = DoubleRatchet::init_sender(
            x3dh.shared_secret(),
            &remote_bundle.signed_prekey,
            x3dh.associated_data.clone(),
        )?;

        Ok(Self {
            participant_identity: participant_identity.into(),
            ratchet,
            pending_prekey: Some(PrekeyHeader {
                ephemeral_key: x3dh.ephemeral_public,
                long_term_key_id: x3dh.long_term_key_id,
                one_time_key_id: x3dh.one_time_key_id,
            }),
        })
    }

    /// Accept a session as the responder.
    ///
    /// Only derives the session; the first message still has to be passed
    /// to `decrypt`.
    pub fn respond(
        participant_identity: impl Into<String>,
        local_identity: &IdentityKeyPair,
        remote_identity: &VerifyingKey,
        long_term_prekey: &PreKeyPair,
        one_time_prekey: Option<&PreKeyPair>,
        first_message: &RatchetMessage,
    ) -> Result<Self, SessionError> {
        let prekey = first_message
            .prekey
            .as_ref()
            .ok_or(SessionError::NotPrekeyMessage)?;

        if long_term_prekey.key_id() != prekey.long_term_key_id
            || one_time_prekey.map(PreKeyPair::key_id) != prekey.one_time_key_id
        {
            return Err(SessionError::PrekeyMismatch);
        }

        let x3dh = X3DH::respond(
            local_identity,
            long_term_prekey,
            one_time_prekey,
            &identity_exchange_key(remote_identity),
            &prekey.ephemeral_key,
        )?;

        let ratchet = DoubleRatchet::init_receiver(
            x3dh.shared_secret(),
            long_term_prekey.private_key(),
            &first_message.payload.header.dh_public,
            x3dh.associated_data.clone(),
        )?;

        Ok(Self {
            participant_identity: participant_identity.into(),
            ratchet,
            pending_prekey: None,
        })
    }

    pub fn participant_identity(&self) -> &str {
        &self.participant_identity
    }

    /// Encrypt a message
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage, SessionError> {
        let payload = self.ratchet.encrypt(plaintext)?;

        Ok(RatchetMessage {
            prekey: self.pending_prekey.clone(),
            payload,
        })
    }

    /// Decrypt a message
    pub fn decrypt(&mut self, message: &RatchetMessage) -> Result<Vec<u8>, SessionError> {
        let plaintext = self.ratchet.decrypt(&message.payload)?;
        self.pending_prekey = None;
        Ok(plaintext)
    }

    pub fn encrypt_string(&mut self, plaintext: &str) -> Result<RatchetMessage, SessionError> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_string(&mut self, message: &RatchetMessage) -> Result<String, SessionError> {
        let plaintext = self.decrypt(message)?;
        String::from_utf8(plaintext).map_err(|_| SessionError::InvalidUtf8)
    }

    /// Serialize the session for storage
    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>, SessionError> {
        serde_json::to_vec(self)
            .map(Zeroizing::new)
            .map_err(|_| SessionError::Serialization)
    }

    /// Restore a session from `to_bytes` output
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionError> {
        serde_json::from_slice(bytes).map_err(|_| SessionError::Serialization)
    }
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("participant_identity", &self.participant_identity)
            .field("pending_prekey", &self.pending_prekey.is_some())
            .finish_non_exhaustive()
    }
}

/// Session errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("X3DH error: {0}")]
    X3DH(#[from] X3DHError),
    #[error("Ratchet error: {0}")]
    Ratchet(#[from] RatchetError),
    #[error("Message does not carry a prekey header")]
    NotPrekeyMessage,
    #[error("Prekeys do not match the ids in the message")]
    PrekeyMismatch,
    #[error("Plaintext is not valid UTF-8")]
    InvalidUtf8,
    #[error("Session serialization failed")]
    Serialization,
}
