//! In-process key directory
//!
//! Behaves like the hosted service for a set of registered cards: token
//! auth, upload tiers, signature checks, one-time key collisions and the
//! pool limit are all enforced. One-time keys are handed out in random
//! order from an injectable RNG so tests can make selection deterministic.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use ed25519_dalek::VerifyingKey;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::{debug, info, warn};
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::card::Card;
use crate::crypto::KeyId;

use super::{
    DirectoryError, IdentityPublicKeySet, KeyDirectoryClient, PublicKeySet, SignedPublicKey,
    ValidatePublicKeysResponse, MAX_ONE_TIME_KEYS,
};

#[derive(Clone, Default)]
struct UserKeys {
    identity_public_key: Option<VerifyingKey>,
    long_term_public_key: Option<SignedPublicKey>,
    one_time_public_keys: Vec<X25519PublicKey>,
    /// Ids of one-time keys already handed out
    used_one_time_keys: HashSet<KeyId>,
}

impl UserKeys {
    fn is_active_one_time_key(&self, id: &KeyId) -> bool {
        self.one_time_public_keys
            .iter()
            .any(|key| KeyId::compute(key.as_bytes()) == *id)
    }
}

struct DirectoryState {
    tokens: HashMap<String, String>,
    cards: HashMap<String, Card>,
    users: HashMap<String, UserKeys>,
    rng: Box<dyn RngCore + Send>,
}

impl DirectoryState {
    fn identity_for(&self, token: &str) -> Result<String, DirectoryError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(DirectoryError::Unauthorized)
    }
}

pub struct InMemoryKeyDirectory {
    state: Mutex<DirectoryState>,
}

impl Default for InMemoryKeyDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKeyDirectory {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Use `rng` for token generation and one-time key selection
    pub fn with_rng(rng: impl RngCore + Send + 'static) -> Self {
        Self {
            state: Mutex::new(DirectoryState {
                tokens: HashMap::new(),
                cards: HashMap::new(),
                users: HashMap::new(),
                rng: Box::new(rng),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, DirectoryState>, DirectoryError> {
        self.state
            .lock()
            .map_err(|_| DirectoryError::Transport("directory state poisoned".to_string()))
    }

    /// Publish a card so uploads can reference it by id
    pub fn register_card(&self, card: Card) -> Result<(), DirectoryError> {
        let mut state = self.lock()?;
        debug!("Registered card {} for {}", card.fingerprint(), card.identity);
        state.cards.insert(card.id.clone(), card);
        Ok(())
    }

    /// Issue an access token acting as `identity`
    pub fn issue_token(&self, identity: &str) -> Result<String, DirectoryError> {
        let mut state = self.lock()?;
        let mut bytes = [0u8; 16];
        state.rng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        state.tokens.insert(token.clone(), identity.to_string());
        Ok(token)
    }

    fn take_public_key_set(
        state: &mut DirectoryState,
        identity: &str,
    ) -> Result<PublicKeySet, DirectoryError> {
        let DirectoryState { users, rng, .. } = state;
        let user = users
            .get_mut(identity)
            .ok_or_else(|| DirectoryError::NotFound(identity.to_string()))?;

        let (Some(identity_public_key), Some(long_term_public_key)) =
            (user.identity_public_key, user.long_term_public_key.clone())
        else {
            return Err(DirectoryError::NotFound(identity.to_string()));
        };

        let one_time_public_key = if user.one_time_public_keys.is_empty() {
            None
        } else {
            let index = rng.gen_range(0..user.one_time_public_keys.len());
            let key = user.one_time_public_keys.swap_remove(index);
            user.used_one_time_keys.insert(KeyId::compute(key.as_bytes()));
            Some(key)
        };

        debug!(
            "Handed out keys of {} ({} one-time keys left)",
            identity,
            user.one_time_public_keys.len()
        );

        Ok(PublicKeySet {
            identity_public_key,
            long_term_public_key,
            one_time_public_key,
        })
    }
}

impl KeyDirectoryClient for InMemoryKeyDirectory {
    fn upload_public_keys(
        &self,
        identity_card_id: Option<&str>,
        long_term_public_key: Option<&SignedPublicKey>,
        one_time_public_keys: &[X25519PublicKey],
        token: &str,
    ) -> Result<(), DirectoryError> {
        let mut state = self.lock()?;
        let identity = state.identity_for(token)?;
        let mut user = state.users.get(&identity).cloned().unwrap_or_default();

        let identity_public_key = match identity_card_id {
            Some(card_id) => {
                let card = state
                    .cards
                    .get(card_id)
                    .ok_or_else(|| DirectoryError::NotFound(format!("card {card_id}")))?;
                if card.identity != identity {
                    return Err(DirectoryError::Rejected(format!(
                        "card {card_id} does not belong to {identity}"
                    )));
                }
                user.identity_public_key = Some(card.public_key);
                card.public_key
            }
            None => user.identity_public_key.ok_or_else(|| {
                DirectoryError::Rejected("identity card must be uploaded first".to_string())
            })?,
        };

        match long_term_public_key {
            Some(key) => {
                if !key.verify(&identity_public_key) {
                    return Err(DirectoryError::Rejected(
                        "long-term key signature is invalid".to_string(),
                    ));
                }
                user.long_term_public_key = Some(key.clone());
            }
            None if user.long_term_public_key.is_none() => {
                return Err(DirectoryError::Rejected(
                    "long-term key must be uploaded first".to_string(),
                ));
            }
            None => {}
        }

        let mut seen = HashSet::new();
        for key in one_time_public_keys {
            let id = KeyId::compute(key.as_bytes());
            if !seen.insert(id) || user.is_active_one_time_key(&id) || user.used_one_time_keys.contains(&id) {
                return Err(DirectoryError::Conflict(format!("one-time key {id} already uploaded")));
            }
        }
        if user.one_time_public_keys.len() + one_time_public_keys.len() > MAX_ONE_TIME_KEYS {
            return Err(DirectoryError::Rejected(format!(
                "at most {MAX_ONE_TIME_KEYS} one-time keys can be stored"
            )));
        }
        user.one_time_public_keys.extend_from_slice(one_time_public_keys);

        info!(
            "{} uploaded keys: card={}, long_term={}, one_time={}",
            identity,
            identity_card_id.is_some(),
            long_term_public_key.is_some(),
            one_time_public_keys.len()
        );
        state.users.insert(identity, user);
        Ok(())
    }

    fn get_number_of_active_one_time_public_keys(&self, token: &str) -> Result<usize, DirectoryError> {
        let state = self.lock()?;
        let identity = state.identity_for(token)?;
        Ok(state
            .users
            .get(&identity)
            .map(|user| user.one_time_public_keys.len())
            .unwrap_or(0))
    }

    fn validate_public_keys(
        &self,
        long_term_key_id: Option<&KeyId>,
        one_time_keys_ids: &[KeyId],
        token: &str,
    ) -> Result<ValidatePublicKeysResponse, DirectoryError> {
        let state = self.lock()?;
        let identity = state.identity_for(token)?;
        let user = state.users.get(&identity).cloned().unwrap_or_default();

        // Anything the directory no longer offers counts as used
        let current_long_term_id = user.long_term_public_key.as_ref().map(SignedPublicKey::key_id);
        let used_long_term_key_id = long_term_key_id
            .filter(|id| current_long_term_id.as_ref() != Some(*id))
            .copied();

        let used_one_time_keys_ids: Vec<KeyId> = one_time_keys_ids
            .iter()
            .filter(|id| !user.is_active_one_time_key(id))
            .copied()
            .collect();

        if !used_one_time_keys_ids.is_empty() || used_long_term_key_id.is_some() {
            debug!(
                "{}: long-term used={}, {} one-time keys used",
                identity,
                used_long_term_key_id.is_some(),
                used_one_time_keys_ids.len()
            );
        }

        Ok(ValidatePublicKeysResponse {
            used_long_term_key_id,
            used_one_time_keys_ids,
        })
    }

    fn get_public_key_set(&self, identity: &str, token: &str) -> Result<PublicKeySet, DirectoryError> {
        let mut state = self.lock()?;
        state.identity_for(token)?;
        Self::take_public_key_set(&mut state, identity)
    }

    fn get_multiple_public_key_sets(
        &self,
        identities: &[&str],
        token: &str,
    ) -> Result<Vec<IdentityPublicKeySet>, DirectoryError> {
        let mut state = self.lock()?;
        state.identity_for(token)?;

        let mut sets = Vec::with_capacity(identities.len());
        for identity in identities {
            match Self::take_public_key_set(&mut state, identity) {
                Ok(public_key_set) => sets.push(IdentityPublicKeySet {
                    identity: identity.to_string(),
                    public_key_set,
                }),
                Err(DirectoryError::NotFound(_)) => {
                    warn!("No published keys for {}, skipping", identity);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(sets)
    }

    fn delete_keys_entity(&self, token: &str) -> Result<(), DirectoryError> {
        let mut state = self.lock()?;
        let identity = state.identity_for(token)?;
        if state.users.remove(&identity).is_some() {
            info!("Deleted keys entity of {}", identity);
        }
        Ok(())
    }
}
