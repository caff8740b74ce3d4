//! Local persistence for prekey records and ratchet sessions
//!
//! Three capability traits with one in-memory and one file-backed
//! implementation each. Both share the same not-found semantics: retrieving
//! or deleting a record that does not exist is an error, a missing session
//! on lookup is `Ok(None)`.

pub mod file;
pub mod memory;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{KeyId, SecureSession};
use crate::util::serde_hex;

pub use file::{FileLongTermKeyStore, FileOneTimeKeyStore, FileSessionStore};
pub use memory::{MemoryLongTermKeyStore, MemoryOneTimeKeyStore, MemorySessionStore};

/// Private long-term prekey with its lifecycle timestamps (unix ms)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongTermKey {
    pub identifier: KeyId,
    #[serde(with = "serde_hex")]
    pub key: Vec<u8>,
    pub created_at: u64,
    /// Set when a newer key replaced this one
    pub outdated_from: Option<u64>,
}

impl LongTermKey {
    pub fn is_active(&self) -> bool {
        self.outdated_from.is_none()
    }
}

impl fmt::Debug for LongTermKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LongTermKey")
            .field("identifier", &self.identifier)
            .field("created_at", &self.created_at)
            .field("outdated_from", &self.outdated_from)
            .finish_non_exhaustive()
    }
}

/// Private one-time prekey
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimeKey {
    pub identifier: KeyId,
    #[serde(with = "serde_hex")]
    pub key: Vec<u8>,
    /// Set once the directory no longer offers the key
    pub orphaned_from: Option<u64>,
}

impl OneTimeKey {
    pub fn is_available(&self) -> bool {
        self.orphaned_from.is_none()
    }
}

impl fmt::Debug for OneTimeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneTimeKey")
            .field("identifier", &self.identifier)
            .field("orphaned_from", &self.orphaned_from)
            .finish_non_exhaustive()
    }
}

/// Long-term key records of one identity
pub trait LongTermKeyStore: Send {
    fn store_key(&mut self, key: &[u8], id: KeyId, created_at: u64) -> Result<LongTermKey, StoreError>;

    fn retrieve_key(&self, id: &KeyId) -> Result<LongTermKey, StoreError>;

    fn delete_key(&mut self, id: &KeyId) -> Result<(), StoreError>;

    fn retrieve_all_keys(&self) -> Result<Vec<LongTermKey>, StoreError>;

    fn mark_key_outdated(&mut self, id: &KeyId, outdated_from: u64) -> Result<(), StoreError>;

    fn reset(&mut self) -> Result<(), StoreError>;
}

/// One-time key records of one identity
pub trait OneTimeKeyStore: Send {
    fn store_key(&mut self, key: &[u8], id: KeyId) -> Result<OneTimeKey, StoreError>;

    fn retrieve_key(&self, id: &KeyId) -> Result<OneTimeKey, StoreError>;

    fn delete_key(&mut self, id: &KeyId) -> Result<(), StoreError>;

    fn retrieve_all_keys(&self) -> Result<Vec<OneTimeKey>, StoreError>;

    fn mark_key_orphaned(&mut self, id: &KeyId, orphaned_from: u64) -> Result<(), StoreError>;

    fn reset(&mut self) -> Result<(), StoreError>;
}

/// One ratchet session per peer identity; storing replaces the previous one
pub trait SessionStore: Send {
    fn store_session(&mut self, session: &SecureSession) -> Result<(), StoreError>;

    fn retrieve_session(&self, participant_identity: &str) -> Result<Option<SecureSession>, StoreError>;

    fn delete_session(&mut self, participant_identity: &str) -> Result<(), StoreError>;

    fn reset(&mut self) -> Result<(), StoreError>;
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Record already exists: {0}")]
    AlreadyExists(String),
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupted record: {0}")]
    Corrupted(String),
}
