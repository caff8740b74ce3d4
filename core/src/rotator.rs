//! Key rotation
//!
//! Reconciles the local key stores with the directory: retires keys the
//! directory reports as used, deletes retired keys once their grace period
//! is over, replaces an expired long-term key and refills the one-time pool.
//! Every step re-reads store state, so an interrupted rotation is finished
//! by the next call.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::{duration_ms, Clock};
use crate::config::{ConfigError, RotatorConfig};
use crate::crypto::{IdentityKeyPair, KeyId, PreKeyPair, SignedPreKey};
use crate::directory::{DirectoryError, KeyDirectoryClient, SignedPublicKey};
use crate::storage::{LongTermKey, LongTermKeyStore, OneTimeKeyStore, StoreError};

/// What a rotation changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationOutcome {
    pub long_term_keys_outdated: usize,
    pub one_time_keys_orphaned: usize,
    pub long_term_keys_deleted: usize,
    pub one_time_keys_deleted: usize,
    /// Id of the long-term key generated by this rotation
    pub new_long_term_key: Option<KeyId>,
    pub one_time_keys_added: usize,
    /// Whether anything was sent to the directory
    pub uploaded: bool,
    pub card_uploaded: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    #[error("Invalid rotator configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Key store error: {0}")]
    Store(#[from] StoreError),
    #[error("Key directory error: {0}")]
    Directory(#[from] DirectoryError),
}

pub struct KeysRotator {
    identity: IdentityKeyPair,
    identity_card_id: String,
    config: RotatorConfig,
    clock: Arc<dyn Clock>,
}

impl KeysRotator {
    pub fn new(
        identity: IdentityKeyPair,
        identity_card_id: impl Into<String>,
        config: RotatorConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RotationError> {
        config.validate()?;
        Ok(Self {
            identity,
            identity_card_id: identity_card_id.into(),
            config,
            clock,
        })
    }

    pub fn config(&self) -> &RotatorConfig {
        &self.config
    }

    /// Run one rotation.
    ///
    /// Store changes made before a failure are kept; calling again
    /// completes the rotation.
    pub fn rotate_keys(
        &self,
        long_term_keys: &mut dyn LongTermKeyStore,
        one_time_keys: &mut dyn OneTimeKeyStore,
        client: &dyn KeyDirectoryClient,
        token: &str,
    ) -> Result<RotationOutcome, RotationError> {
        let now = self.clock.now_ms();
        let mut outcome = RotationOutcome::default();

        let long_term_records = long_term_keys.retrieve_all_keys()?;
        let one_time_records = one_time_keys.retrieve_all_keys()?;

        let mut active = self.settle_active_long_term_key(long_term_keys, &long_term_records, now)?;
        let mut available: HashSet<KeyId> = one_time_records
            .iter()
            .filter(|key| key.is_available())
            .map(|key| key.identifier)
            .collect();
        let had_active = active.is_some();
        let available_ids: Vec<KeyId> = available.iter().copied().collect();

        debug!(
            "Validating long-term key {:?} and {} one-time keys",
            active.as_ref().map(|key| key.identifier),
            available_ids.len()
        );
        let response = client.validate_public_keys(
            active.as_ref().map(|key| &key.identifier),
            &available_ids,
            token,
        )?;

        let mut active_reported_used = false;
        if let Some(used) = response.used_long_term_key_id {
            match active.as_ref() {
                Some(key) if key.identifier == used => {
                    long_term_keys.mark_key_outdated(&used, now)?;
                    outcome.long_term_keys_outdated += 1;
                    active_reported_used = true;
                    active = None;
                    info!("Long-term key {} is no longer published", used);
                }
                _ => warn!("Directory reported unknown long-term key {} as used", used),
            }
        }

        for used in &response.used_one_time_keys_ids {
            if available.remove(used) {
                one_time_keys.mark_key_orphaned(used, now)?;
                outcome.one_time_keys_orphaned += 1;
            } else {
                warn!("Directory reported unknown one-time key {} as used", used);
            }
        }
        if outcome.one_time_keys_orphaned > 0 {
            debug!("Marked {} one-time keys orphaned", outcome.one_time_keys_orphaned);
        }

        let outdated_ttl = duration_ms(self.config.outdated_long_term_key_ttl);
        for key in &long_term_records {
            if let Some(outdated_from) = key.outdated_from {
                if now.saturating_sub(outdated_from) > outdated_ttl {
                    long_term_keys.delete_key(&key.identifier)?;
                    outcome.long_term_keys_deleted += 1;
                    debug!("Deleted outdated long-term key {}", key.identifier);
                }
            }
        }

        let orphaned_ttl = duration_ms(self.config.orphaned_one_time_key_ttl);
        for key in &one_time_records {
            if let Some(orphaned_from) = key.orphaned_from {
                if now.saturating_sub(orphaned_from) > orphaned_ttl {
                    one_time_keys.delete_key(&key.identifier)?;
                    outcome.one_time_keys_deleted += 1;
                }
            }
        }

        let long_term_ttl = duration_ms(self.config.long_term_key_ttl);
        let expired = active
            .as_ref()
            .is_some_and(|key| now.saturating_sub(key.created_at) > long_term_ttl);

        let mut new_long_term_key = None;
        if active.is_none() || expired {
            if let Some(previous) = active.take() {
                long_term_keys.mark_key_outdated(&previous.identifier, now)?;
                outcome.long_term_keys_outdated += 1;
                info!("Long-term key {} expired", previous.identifier);
            }

            let signed = SignedPreKey::generate(&self.identity);
            let id = signed.key_id();
            long_term_keys.store_key(signed.key_pair().private_bytes().as_slice(), id, now)?;
            info!("Generated long-term key {}", id);

            outcome.new_long_term_key = Some(id);
            new_long_term_key = Some(SignedPublicKey {
                public_key: signed.public_key(),
                signature: signed.signature(),
            });
        }

        let deficit = self
            .config
            .desired_number_of_one_time_keys
            .saturating_sub(available.len());
        let mut new_one_time_keys = Vec::with_capacity(deficit);
        for _ in 0..deficit {
            let key = PreKeyPair::generate();
            one_time_keys.store_key(key.private_bytes().as_slice(), key.key_id())?;
            new_one_time_keys.push(key.public_key());
        }
        outcome.one_time_keys_added = deficit;

        if new_long_term_key.is_none() && new_one_time_keys.is_empty() {
            debug!("Keys are up to date, nothing to upload");
            return Ok(outcome);
        }

        // The directory only lacks our card when it never held a long-term key of ours
        let send_card = !had_active || active_reported_used;
        client.upload_public_keys(
            send_card.then_some(self.identity_card_id.as_str()),
            new_long_term_key.as_ref(),
            &new_one_time_keys,
            token,
        )?;
        outcome.uploaded = true;
        outcome.card_uploaded = send_card;

        info!(
            "Uploaded keys: card={}, long_term={}, one_time={}",
            send_card,
            new_long_term_key.is_some(),
            new_one_time_keys.len()
        );
        Ok(outcome)
    }

    /// Newest active long-term key; any other active key is marked outdated
    fn settle_active_long_term_key(
        &self,
        store: &mut dyn LongTermKeyStore,
        records: &[LongTermKey],
        now: u64,
    ) -> Result<Option<LongTermKey>, RotationError> {
        let mut active: Vec<&LongTermKey> = records.iter().filter(|key| key.is_active()).collect();
        active.sort_by_key(|key| key.created_at);

        let newest = active.pop().cloned();
        for stale in active {
            warn!("Found extra active long-term key {}, retiring it", stale.identifier);
            store.mark_key_outdated(&stale.identifier, now)?;
        }
        Ok(newest)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use x25519_dalek::PublicKey as X25519PublicKey;

    use super::*;
    use crate::card::Card;
    use crate::clock::ManualClock;
    use crate::directory::{
        IdentityPublicKeySet, InMemoryKeyDirectory, PublicKeySet, ValidatePublicKeysResponse,
    };
    use crate::storage::{MemoryLongTermKeyStore, MemoryOneTimeKeyStore, OneTimeKey};

    const TTL: Duration = Duration::from_secs(100);
    const DESIRED: usize = 10;

    struct Fixture {
        directory: InMemoryKeyDirectory,
        clock: ManualClock,
        rotator: KeysRotator,
        long_term: MemoryLongTermKeyStore,
        one_time: MemoryOneTimeKeyStore,
        token: String,
        reader_token: String,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_ttl(TTL)
        }

        fn with_ttl(ttl: Duration) -> Self {
            let directory = InMemoryKeyDirectory::new();
            let identity = IdentityKeyPair::generate();
            let card = Card::new("alice", identity.verifying_key());
            directory.register_card(card.clone()).unwrap();

            let clock = ManualClock::new(1_000_000);
            let rotator = KeysRotator::new(
                identity,
                card.id,
                RotatorConfig::uniform(ttl, DESIRED),
                Arc::new(clock.clone()),
            )
            .unwrap();

            Self {
                token: directory.issue_token("alice").unwrap(),
                reader_token: directory.issue_token("bob").unwrap(),
                directory,
                clock,
                rotator,
                long_term: MemoryLongTermKeyStore::new(),
                one_time: MemoryOneTimeKeyStore::new(),
            }
        }

        fn rotate(&mut self) -> RotationOutcome {
            self.rotator
                .rotate_keys(&mut self.long_term, &mut self.one_time, &self.directory, &self.token)
                .unwrap()
        }

        fn fetch(&self) -> PublicKeySet {
            self.directory
                .get_public_key_set("alice", &self.reader_token)
                .unwrap()
        }

        fn server_count(&self) -> usize {
            self.directory
                .get_number_of_active_one_time_public_keys(&self.token)
                .unwrap()
        }

        fn one_time_keys(&self) -> Vec<OneTimeKey> {
            self.one_time.retrieve_all_keys().unwrap()
        }

        fn long_term_keys(&self) -> Vec<LongTermKey> {
            self.long_term.retrieve_all_keys().unwrap()
        }
    }

    #[test]
    fn test_first_rotation_publishes_everything() {
        let mut fixture = Fixture::new();
        let outcome = fixture.rotate();

        assert!(outcome.uploaded);
        assert!(outcome.card_uploaded);
        assert_eq!(outcome.one_time_keys_added, DESIRED);
        assert_eq!(fixture.server_count(), DESIRED);

        let long_term_keys = fixture.long_term_keys();
        assert_eq!(long_term_keys.len(), 1);
        assert_eq!(Some(long_term_keys[0].identifier), outcome.new_long_term_key);
        assert_eq!(long_term_keys[0].created_at, 1_000_000);

        let set = fixture.fetch();
        assert_eq!(
            set.long_term_public_key.key_id(),
            long_term_keys[0].identifier
        );

        // The handed-out key exists locally with matching private material
        let one_time_id = KeyId::compute(set.one_time_public_key.unwrap().as_bytes());
        let record = fixture.one_time.retrieve_key(&one_time_id).unwrap();
        let restored = PreKeyPair::from_private_bytes(&record.key).unwrap();
        assert_eq!(restored.key_id(), one_time_id);
    }

    #[test]
    fn test_rotation_is_idempotent() {
        let mut fixture = Fixture::new();
        fixture.rotate();
        let long_term = fixture.long_term_keys();
        let one_time = fixture.one_time_keys();

        let outcome = fixture.rotate();
        assert_eq!(outcome, RotationOutcome::default());
        assert_eq!(fixture.long_term_keys(), long_term);
        assert_eq!(fixture.one_time_keys(), one_time);
    }

    #[test]
    fn test_consumed_keys_orphaned_and_replaced() {
        let mut fixture = Fixture::new();
        fixture.rotate();

        let taken: Vec<KeyId> = (0..3)
            .map(|_| KeyId::compute(fixture.fetch().one_time_public_key.unwrap().as_bytes()))
            .collect();
        assert_eq!(fixture.server_count(), DESIRED - 3);

        let outcome = fixture.rotate();
        assert_eq!(outcome.one_time_keys_orphaned, 3);
        assert_eq!(outcome.one_time_keys_added, 3);
        assert!(outcome.uploaded);
        assert!(!outcome.card_uploaded);
        assert_eq!(outcome.new_long_term_key, None);
        assert_eq!(fixture.server_count(), DESIRED);

        let records = fixture.one_time_keys();
        assert_eq!(records.len(), DESIRED + 3);
        for id in &taken {
            let record = fixture.one_time.retrieve_key(id).unwrap();
            assert_eq!(record.orphaned_from, Some(1_000_000));
        }
    }

    #[test]
    fn test_orphaned_keys_deleted_after_ttl() {
        let mut fixture = Fixture::new();
        fixture.rotate();
        let taken = KeyId::compute(fixture.fetch().one_time_public_key.unwrap().as_bytes());
        fixture.rotate();

        // Exactly at the TTL the key is kept
        fixture.clock.advance(TTL);
        let outcome = fixture.rotate();
        assert_eq!(outcome.one_time_keys_deleted, 0);
        assert!(fixture.one_time.retrieve_key(&taken).is_ok());

        fixture.clock.advance(Duration::from_millis(1));
        let outcome = fixture.rotate();
        assert_eq!(outcome.one_time_keys_deleted, 1);
        assert!(matches!(
            fixture.one_time.retrieve_key(&taken),
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(fixture.one_time_keys().len(), DESIRED);
    }

    #[test]
    fn test_long_term_key_rotated_after_ttl() {
        let mut fixture = Fixture::new();
        let first = fixture.rotate().new_long_term_key.unwrap();

        fixture.clock.advance(TTL + Duration::from_millis(1));
        let outcome = fixture.rotate();
        let second = outcome.new_long_term_key.unwrap();
        assert_ne!(first, second);
        assert_eq!(outcome.long_term_keys_outdated, 1);
        assert!(outcome.uploaded);
        assert!(!outcome.card_uploaded);
        assert_eq!(outcome.one_time_keys_added, 0);

        let old = fixture.long_term.retrieve_key(&first).unwrap();
        assert_eq!(old.outdated_from, Some(fixture.clock.now_ms()));
        assert!(fixture.long_term.retrieve_key(&second).unwrap().is_active());
        assert_eq!(fixture.fetch().long_term_public_key.key_id(), second);

        // The outdated key stays until its own TTL has passed
        fixture.clock.advance(TTL);
        assert_eq!(fixture.rotate().long_term_keys_deleted, 0);
        fixture.clock.advance(Duration::from_millis(1));
        let outcome = fixture.rotate();
        assert_eq!(outcome.long_term_keys_deleted, 1);
        assert!(fixture.long_term.retrieve_key(&first).is_err());

        // `second` expired at the same moment and was replaced
        let remaining = fixture.long_term_keys();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining.iter().filter(|key| key.is_active()).count(), 1);
    }

    /// Delegates to the real directory but fails every upload
    struct FailingUploads<'a>(&'a InMemoryKeyDirectory);

    impl KeyDirectoryClient for FailingUploads<'_> {
        fn upload_public_keys(
            &self,
            _: Option<&str>,
            _: Option<&SignedPublicKey>,
            _: &[X25519PublicKey],
            _: &str,
        ) -> Result<(), DirectoryError> {
            Err(DirectoryError::Transport("connection reset".to_string()))
        }

        fn get_number_of_active_one_time_public_keys(&self, token: &str) -> Result<usize, DirectoryError> {
            self.0.get_number_of_active_one_time_public_keys(token)
        }

        fn validate_public_keys(
            &self,
            long_term_key_id: Option<&KeyId>,
            one_time_keys_ids: &[KeyId],
            token: &str,
        ) -> Result<ValidatePublicKeysResponse, DirectoryError> {
            self.0.validate_public_keys(long_term_key_id, one_time_keys_ids, token)
        }

        fn get_public_key_set(&self, identity: &str, token: &str) -> Result<PublicKeySet, DirectoryError> {
            self.0.get_public_key_set(identity, token)
        }

        fn get_multiple_public_key_sets(
            &self,
            identities: &[&str],
            token: &str,
        ) -> Result<Vec<IdentityPublicKeySet>, DirectoryError> {
            self.0.get_multiple_public_key_sets(identities, token)
        }

        fn delete_keys_entity(&self, token: &str) -> Result<(), DirectoryError> {
            self.0.delete_keys_entity(token)
        }
    }

    #[test]
    fn test_zero_ttl_rotates_on_every_elapsed_tick() {
        let mut fixture = Fixture::with_ttl(Duration::ZERO);
        let first = fixture.rotate().new_long_term_key.unwrap();
        assert_eq!(fixture.rotate(), RotationOutcome::default());

        fixture.clock.advance(Duration::from_millis(1));
        let outcome = fixture.rotate();
        let second = outcome.new_long_term_key.unwrap();
        assert_ne!(first, second);
        assert_eq!(outcome.long_term_keys_outdated, 1);
        assert_eq!(fixture.fetch().long_term_public_key.key_id(), second);

        fixture.clock.advance(Duration::from_millis(1));
        let outcome = fixture.rotate();
        assert_eq!(outcome.long_term_keys_deleted, 1);
        assert!(fixture.long_term.retrieve_key(&first).is_err());
    }

    #[test]
    fn test_failed_upload_recovered_by_next_rotation() {
        let mut fixture = Fixture::new();
        let failing = FailingUploads(&fixture.directory);
        let result = fixture.rotator.rotate_keys(
            &mut fixture.long_term,
            &mut fixture.one_time,
            &failing,
            &fixture.token,
        );
        assert!(matches!(
            result,
            Err(RotationError::Directory(DirectoryError::Transport(_)))
        ));

        // Generated keys were kept locally
        assert_eq!(fixture.long_term_keys().len(), 1);
        assert_eq!(fixture.one_time_keys().len(), DESIRED);

        let outcome = fixture.rotate();
        assert!(outcome.card_uploaded);
        assert_eq!(outcome.long_term_keys_outdated, 1);
        assert_eq!(outcome.one_time_keys_orphaned, DESIRED);
        assert_eq!(fixture.server_count(), DESIRED);
        assert_eq!(fixture.rotate(), RotationOutcome::default());

        let set = fixture.fetch();
        assert_eq!(Some(set.long_term_public_key.key_id()), outcome.new_long_term_key);
    }

    #[test]
    fn test_rejects_oversized_pool() {
        let result = KeysRotator::new(
            IdentityKeyPair::generate(),
            "card",
            RotatorConfig::uniform(TTL, 151),
            Arc::new(ManualClock::new(0)),
        );
        assert!(matches!(result, Err(RotationError::Config(_))));
    }
}
