//! Key directory client contract
//!
//! The directory stores each identity's published keys in three tiers:
//! identity card, signed long-term key, one-time key pool. A tier can only
//! be filled when the tier above it is already present.

pub mod memory;

use std::sync::Arc;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::crypto::{IdentityKeyPair, KeyId, PreKeyBundle};
use crate::util::serde_hex;

pub use memory::InMemoryKeyDirectory;

/// Most one-time keys the directory holds per identity
pub const MAX_ONE_TIME_KEYS: usize = 150;

/// Long-term public key with the identity key's signature over it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPublicKey {
    #[serde(with = "serde_hex::x25519")]
    pub public_key: X25519PublicKey,
    #[serde(with = "serde_hex::signature")]
    pub signature: Signature,
}

impl SignedPublicKey {
    pub fn sign(public_key: X25519PublicKey, identity: &IdentityKeyPair) -> Self {
        Self {
            public_key,
            signature: identity.sign(public_key.as_bytes()),
        }
    }

    pub fn verify(&self, identity_public_key: &VerifyingKey) -> bool {
        identity_public_key
            .verify(self.public_key.as_bytes(), &self.signature)
            .is_ok()
    }

    pub fn key_id(&self) -> KeyId {
        KeyId::compute(self.public_key.as_bytes())
    }
}

/// Keys a sender needs to start a session with one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeySet {
    #[serde(with = "serde_hex::verifying_key")]
    pub identity_public_key: VerifyingKey,
    pub long_term_public_key: SignedPublicKey,
    #[serde(default, with = "serde_hex::option_x25519")]
    pub one_time_public_key: Option<X25519PublicKey>,
}

impl From<&PublicKeySet> for PreKeyBundle {
    fn from(set: &PublicKeySet) -> Self {
        PreKeyBundle {
            identity_verifying_key: set.identity_public_key,
            signed_prekey: set.long_term_public_key.public_key,
            signed_prekey_signature: set.long_term_public_key.signature,
            one_time_prekey: set.one_time_public_key,
        }
    }
}

/// `PublicKeySet` tagged with the identity it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPublicKeySet {
    pub identity: String,
    pub public_key_set: PublicKeySet,
}

/// Subset of the validated ids that are no longer active on the directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatePublicKeysResponse {
    pub used_long_term_key_id: Option<KeyId>,
    pub used_one_time_keys_ids: Vec<KeyId>,
}

/// Directory errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Rejected: {0}")]
    Rejected(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Calls the key directory makes available to a client.
///
/// `token` authenticates the caller; uploads, counts, validation and
/// deletion act on the caller's own identity.
pub trait KeyDirectoryClient: Send + Sync {
    /// Upload keys, at most `MAX_ONE_TIME_KEYS` one-time keys in total
    fn upload_public_keys(
        &self,
        identity_card_id: Option<&str>,
        long_term_public_key: Option<&SignedPublicKey>,
        one_time_public_keys: &[X25519PublicKey],
        token: &str,
    ) -> Result<(), DirectoryError>;

    /// Number of one-time keys still available, `0..=MAX_ONE_TIME_KEYS`
    fn get_number_of_active_one_time_public_keys(&self, token: &str) -> Result<usize, DirectoryError>;

    fn validate_public_keys(
        &self,
        long_term_key_id: Option<&KeyId>,
        one_time_keys_ids: &[KeyId],
        token: &str,
    ) -> Result<ValidatePublicKeysResponse, DirectoryError>;

    /// Fetch a bundle, consuming one one-time key if any is left
    fn get_public_key_set(&self, identity: &str, token: &str) -> Result<PublicKeySet, DirectoryError>;

    /// Identities without published keys are left out of the result
    fn get_multiple_public_key_sets(
        &self,
        identities: &[&str],
        token: &str,
    ) -> Result<Vec<IdentityPublicKeySet>, DirectoryError>;

    fn delete_keys_entity(&self, token: &str) -> Result<(), DirectoryError>;
}

impl<T: KeyDirectoryClient + ?Sized> KeyDirectoryClient for Arc<T> {
    fn upload_public_keys(
        &self,
        identity_card_id: Option<&str>,
        long_term_public_key: Option<&SignedPublicKey>,
        one_time_public_keys: &[X25519PublicKey],
        token: &str,
    ) -> Result<(), DirectoryError> {
        (**self).upload_public_keys(identity_card_id, long_term_public_key, one_time_public_keys, token)
    }

    fn get_number_of_active_one_time_public_keys(&self, token: &str) -> Result<usize, DirectoryError> {
        (**self).get_number_of_active_one_time_public_keys(token)
    }

    fn validate_public_keys(
        &self,
        long_term_key_id: Option<&KeyId>,
        one_time_keys_ids: &[KeyId],
        token: &str,
    ) -> Result<ValidatePublicKeysResponse, DirectoryError> {
        (**self).validate_public_keys(long_term_key_id, one_time_keys_ids, token)
    }

    fn get_public_key_set(&self, identity: &str, token: &str) -> Result<PublicKeySet, DirectoryError> {
        (**self).get_public_key_set(identity, token)
    }

    fn get_multiple_public_key_sets(
        &self,
        identities: &[&str],
        token: &str,
    ) -> Result<Vec<IdentityPublicKeySet>, DirectoryError> {
        (**self).get_multiple_public_key_sets(identities, token)
    }

    fn delete_keys_entity(&self, token: &str) -> Result<(), DirectoryError> {
        (**self).delete_keys_entity(token)
    }
}

/// Source of directory auth tokens
pub trait AccessTokenProvider: Send + Sync {
    fn get_token(&self) -> Result<String, DirectoryError>;
}

/// Token fixed at construction
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl AccessTokenProvider for StaticTokenProvider {
    fn get_token(&self) -> Result<String, DirectoryError> {
        Ok(self.token.clone())
    }
}
