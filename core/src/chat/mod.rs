//! Session manager
//!
//! `SecureChat` ties one local identity to its key stores, the key directory
//! and the rotator. It establishes sessions in either role and routes
//! encryption by peer identity.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::card::Card;
use crate::clock::Clock;
use crate::config::{RotatorConfig, StorageConfig};
use crate::crypto::{IdentityKeyPair, KeyError, PreKeyBundle, PreKeyPair, RatchetMessage, SecureSession, SessionError};
use crate::directory::{AccessTokenProvider, DirectoryError, KeyDirectoryClient, PublicKeySet};
use crate::rotator::{KeysRotator, RotationError, RotationOutcome};
use crate::storage::{
    FileLongTermKeyStore, FileOneTimeKeyStore, FileSessionStore, LongTermKeyStore, MemoryLongTermKeyStore,
    MemoryOneTimeKeyStore, MemorySessionStore, OneTimeKeyStore, SessionStore, StoreError,
};

/// Persistence backing one `SecureChat`
pub struct ChatStores {
    pub long_term_keys: Box<dyn LongTermKeyStore>,
    pub one_time_keys: Box<dyn OneTimeKeyStore>,
    pub sessions: Box<dyn SessionStore>,
}

impl ChatStores {
    pub fn in_memory() -> Self {
        Self {
            long_term_keys: Box::new(MemoryLongTermKeyStore::new()),
            one_time_keys: Box::new(MemoryOneTimeKeyStore::new()),
            sessions: Box::new(MemorySessionStore::new()),
        }
    }

    /// File-backed stores under the identity's directory
    pub fn open(config: &StorageConfig, identity: &str) -> Result<Self, StoreError> {
        Ok(Self {
            long_term_keys: Box::new(FileLongTermKeyStore::open(config, identity)?),
            one_time_keys: Box::new(FileOneTimeKeyStore::open(config, identity)?),
            sessions: Box::new(FileSessionStore::open(config, identity)?),
        })
    }
}

/// Chat errors
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Identity key does not match the card")]
    IdentityKeyMismatch,
    #[error("Long-term key signature is invalid")]
    InvalidLongTermKeySignature,
    #[error("No session with {0}")]
    NoSession(String),
    #[error("Stored key is invalid: {0}")]
    Key(#[from] KeyError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Key directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("Key rotation failed: {0}")]
    Rotation(#[from] RotationError),
}

pub struct SecureChat {
    identity: IdentityKeyPair,
    card: Card,
    client: Arc<dyn KeyDirectoryClient>,
    token_provider: Arc<dyn AccessTokenProvider>,
    long_term_keys: Box<dyn LongTermKeyStore>,
    one_time_keys: Box<dyn OneTimeKeyStore>,
    sessions: Box<dyn SessionStore>,
    rotator: KeysRotator,
    clock: Arc<dyn Clock>,
}

impl SecureChat {
    /// Fails with `IdentityKeyMismatch` when `identity` is not the key on `card`
    pub fn new(
        identity: IdentityKeyPair,
        card: Card,
        client: Arc<dyn KeyDirectoryClient>,
        token_provider: Arc<dyn AccessTokenProvider>,
        stores: ChatStores,
        config: RotatorConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ChatError> {
        if identity.verifying_key() != card.public_key {
            return Err(ChatError::IdentityKeyMismatch);
        }

        let rotator = KeysRotator::new(identity.clone(), card.id.clone(), config, clock.clone())?;
        info!("Secure chat ready for {} ({})", card.identity, card.fingerprint());

        Ok(Self {
            identity,
            card,
            client,
            token_provider,
            long_term_keys: stores.long_term_keys,
            one_time_keys: stores.one_time_keys,
            sessions: stores.sessions,
            rotator,
            clock,
        })
    }

    pub fn identity_card(&self) -> &Card {
        &self.card
    }

    pub fn rotate_keys(&mut self) -> Result<RotationOutcome, ChatError> {
        let token = self.token_provider.get_token()?;
        let outcome = self.rotator.rotate_keys(
            self.long_term_keys.as_mut(),
            self.one_time_keys.as_mut(),
            self.client.as_ref(),
            &token,
        )?;
        Ok(outcome)
    }

    /// Fetch the peer's keys and start a session as the initiator.
    ///
    /// Replaces any session already stored for the peer.
    pub fn start_new_session_as_sender(&mut self, receiver: &Card) -> Result<SecureSession, ChatError> {
        let token = self.token_provider.get_token()?;
        let set = self.client.get_public_key_set(&receiver.identity, &token)?;

        let session = self.initiate_session(receiver, &set)?;
        self.sessions.store_session(&session)?;
        info!("Started session with {} as sender", receiver.identity);
        Ok(session)
    }

    /// Start sessions with several peers using one directory request.
    ///
    /// Peers without published keys are skipped. Nothing is stored unless
    /// every fetched key set produces a session.
    pub fn start_multiple_sessions_as_sender(&mut self, receivers: &[Card]) -> Result<Vec<SecureSession>, ChatError> {
        let token = self.token_provider.get_token()?;
        let identities: Vec<&str> = receivers.iter().map(|card| card.identity.as_str()).collect();
        let sets = self.client.get_multiple_public_key_sets(&identities, &token)?;

        let mut sets: HashMap<String, PublicKeySet> = sets
            .into_iter()
            .map(|set| (set.identity, set.public_key_set))
            .collect();

        let mut sessions = Vec::with_capacity(receivers.len());
        for receiver in receivers {
            match sets.remove(&receiver.identity) {
                Some(set) => sessions.push(self.initiate_session(receiver, &set)?),
                None => warn!("No key set returned for {}", receiver.identity),
            }
        }

        for session in &sessions {
            self.sessions.store_session(session)?;
        }
        info!("Started {} sessions as sender", sessions.len());
        Ok(sessions)
    }

    /// Accept a session from the first message a peer sent.
    ///
    /// The message itself is not decrypted; pass it to `decrypt` next.
    /// Replaces any session already stored for the peer.
    pub fn start_new_session_as_receiver(
        &mut self,
        sender: &Card,
        message: &RatchetMessage,
    ) -> Result<SecureSession, ChatError> {
        let long_term_key_id = message
            .long_term_key_id()
            .ok_or(SessionError::NotPrekeyMessage)?;

        let long_term_record = self.long_term_keys.retrieve_key(&long_term_key_id)?;
        let long_term_key = PreKeyPair::from_private_bytes(&long_term_record.key)?;

        let one_time_record = match message.one_time_key_id() {
            Some(id) => Some(self.one_time_keys.retrieve_key(&id)?),
            None => None,
        };
        let one_time_key = one_time_record
            .as_ref()
            .map(|record| PreKeyPair::from_private_bytes(&record.key))
            .transpose()?;

        let session = SecureSession::respond(
            sender.identity.clone(),
            &self.identity,
            &sender.public_key,
            &long_term_key,
            one_time_key.as_ref(),
            message,
        )?;

        if let Some(record) = one_time_record.filter(|record| record.is_available()) {
            self.one_time_keys
                .mark_key_orphaned(&record.identifier, self.clock.now_ms())?;
            debug!("One-time key {} consumed by {}", record.identifier, sender.identity);
        }

        self.sessions.store_session(&session)?;
        info!(
            "Started session with {} as receiver (long-term key {})",
            sender.identity, long_term_key_id
        );
        Ok(session)
    }

    pub fn existing_session(&self, participant_identity: &str) -> Result<Option<SecureSession>, ChatError> {
        Ok(self.sessions.retrieve_session(participant_identity)?)
    }

    pub fn delete_session(&mut self, participant_identity: &str) -> Result<(), ChatError> {
        self.sessions.delete_session(participant_identity)?;
        info!("Deleted session with {}", participant_identity);
        Ok(())
    }

    /// Encrypt for a peer and persist the advanced session
    pub fn encrypt(&mut self, participant_identity: &str, plaintext: &[u8]) -> Result<RatchetMessage, ChatError> {
        let mut session = self.load_session(participant_identity)?;
        let message = session.encrypt(plaintext)?;
        self.sessions.store_session(&session)?;
        Ok(message)
    }

    /// Decrypt from a peer; the stored session is only advanced on success
    pub fn decrypt(&mut self, participant_identity: &str, message: &RatchetMessage) -> Result<Vec<u8>, ChatError> {
        let mut session = self.load_session(participant_identity)?;
        let plaintext = session.decrypt(message)?;
        self.sessions.store_session(&session)?;
        Ok(plaintext)
    }

    pub fn encrypt_string(&mut self, participant_identity: &str, plaintext: &str) -> Result<RatchetMessage, ChatError> {
        self.encrypt(participant_identity, plaintext.as_bytes())
    }

    pub fn decrypt_string(&mut self, participant_identity: &str, message: &RatchetMessage) -> Result<String, ChatError> {
        let plaintext = self.decrypt(participant_identity, message)?;
        String::from_utf8(plaintext).map_err(|_| ChatError::Session(SessionError::InvalidUtf8))
    }

    /// Remove the identity's keys from the directory and wipe local state
    pub fn reset(&mut self) -> Result<(), ChatError> {
        let token = self.token_provider.get_token()?;
        self.client.delete_keys_entity(&token)?;

        self.sessions.reset()?;
        self.long_term_keys.reset()?;
        self.one_time_keys.reset()?;
        info!("Reset keys and sessions of {}", self.card.identity);
        Ok(())
    }

    pub fn active_one_time_keys_on_server(&self) -> Result<usize, ChatError> {
        let token = self.token_provider.get_token()?;
        Ok(self.client.get_number_of_active_one_time_public_keys(&token)?)
    }

    fn load_session(&self, participant_identity: &str) -> Result<SecureSession, ChatError> {
        self.sessions
            .retrieve_session(participant_identity)?
            .ok_or_else(|| ChatError::NoSession(participant_identity.to_string()))
    }

    fn initiate_session(&self, receiver: &Card, set: &PublicKeySet) -> Result<SecureSession, ChatError> {
        if set.identity_public_key != receiver.public_key {
            return Err(ChatError::IdentityKeyMismatch);
        }
        if !set.long_term_public_key.verify(&receiver.public_key) {
            warn!("Rejected long-term key of {}: bad signature", receiver.identity);
            return Err(ChatError::InvalidLongTermKeySignature);
        }

        let bundle = PreKeyBundle::from(set);
        Ok(SecureSession::initiate(receiver.identity.clone(), &self.identity, &bundle)?)
    }
}

#[cfg(test)]
mod tests;
