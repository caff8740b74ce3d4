//! In-memory stores for tests and ephemeral identities

use std::collections::{BTreeMap, HashMap};

use crate::crypto::{KeyId, SecureSession};

use super::{LongTermKey, LongTermKeyStore, OneTimeKey, OneTimeKeyStore, SessionStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryLongTermKeyStore {
    keys: BTreeMap<KeyId, LongTermKey>,
}

impl MemoryLongTermKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LongTermKeyStore for MemoryLongTermKeyStore {
    fn store_key(&mut self, key: &[u8], id: KeyId, created_at: u64) -> Result<LongTermKey, StoreError> {
        if self.keys.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        let record = LongTermKey {
            identifier: id,
            key: key.to_vec(),
            created_at,
            outdated_from: None,
        };
        self.keys.insert(id, record.clone());
        Ok(record)
    }

    fn retrieve_key(&self, id: &KeyId) -> Result<LongTermKey, StoreError> {
        self.keys
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn delete_key(&mut self, id: &KeyId) -> Result<(), StoreError> {
        self.keys
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn retrieve_all_keys(&self) -> Result<Vec<LongTermKey>, StoreError> {
        Ok(self.keys.values().cloned().collect())
    }

    fn mark_key_outdated(&mut self, id: &KeyId, outdated_from: u64) -> Result<(), StoreError> {
        let record = self
            .keys
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.outdated_from = Some(outdated_from);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), StoreError> {
        self.keys.clear();
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryOneTimeKeyStore {
    keys: BTreeMap<KeyId, OneTimeKey>,
}

impl MemoryOneTimeKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OneTimeKeyStore for MemoryOneTimeKeyStore {
    fn store_key(&mut self, key: &[u8], id: KeyId) -> Result<OneTimeKey, StoreError> {
        if self.keys.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        let record = OneTimeKey {
            identifier: id,
            key: key.to_vec(),
            orphaned_from: None,
        };
        self.keys.insert(id, record.clone());
        Ok(record)
    }

    fn retrieve_key(&self, id: &KeyId) -> Result<OneTimeKey, StoreError> {
        self.keys
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn delete_key(&mut self, id: &KeyId) -> Result<(), StoreError> {
        self.keys
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn retrieve_all_keys(&self) -> Result<Vec<OneTimeKey>, StoreError> {
        Ok(self.keys.values().cloned().collect())
    }

    fn mark_key_orphaned(&mut self, id: &KeyId, orphaned_from: u64) -> Result<(), StoreError> {
        let record = self
            .keys
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.orphaned_from = Some(orphaned_from);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), StoreError> {
        self.keys.clear();
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: HashMap<String, SecureSession>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn store_session(&mut self, session: &SecureSession) -> Result<(), StoreError> {
        self.sessions
            .insert(session.participant_identity().to_string(), session.clone());
        Ok(())
    }

    fn retrieve_session(&self, participant_identity: &str) -> Result<Option<SecureSession>, StoreError> {
        Ok(self.sessions.get(participant_identity).cloned())
    }

    fn delete_session(&mut self, participant_identity: &str) -> Result<(), StoreError> {
        self.sessions
            .remove(participant_identity)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(participant_identity.to_string()))
    }

    fn reset(&mut self) -> Result<(), StoreError> {
        self.sessions.clear();
        Ok(())
    }
}
