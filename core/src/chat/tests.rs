//! Session manager tests over the in-memory directory

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use x25519_dalek::PublicKey as X25519PublicKey;

use super::*;
use crate::clock::ManualClock;
use crate::crypto::KeyId;
use crate::directory::{
    IdentityPublicKeySet, InMemoryKeyDirectory, SignedPublicKey, StaticTokenProvider, ValidatePublicKeysResponse,
};

const DESIRED: usize = 5;

struct Party {
    chat: SecureChat,
    card: Card,
}

fn party(directory: &Arc<InMemoryKeyDirectory>, clock: &ManualClock, name: &str) -> Party {
    let client: Arc<dyn KeyDirectoryClient> = directory.clone();
    party_with_client(directory, client, clock, name)
}

fn party_with_client(
    directory: &InMemoryKeyDirectory,
    client: Arc<dyn KeyDirectoryClient>,
    clock: &ManualClock,
    name: &str,
) -> Party {
    let identity = IdentityKeyPair::generate();
    let card = Card::new(name, identity.verifying_key());
    directory.register_card(card.clone()).unwrap();
    let token = directory.issue_token(name).unwrap();

    let chat = SecureChat::new(
        identity,
        card.clone(),
        client,
        Arc::new(StaticTokenProvider::new(token)),
        ChatStores::in_memory(),
        RotatorConfig::uniform(Duration::from_secs(60), DESIRED),
        Arc::new(clock.clone()),
    )
    .unwrap();

    Party { chat, card }
}

fn setup() -> (Arc<InMemoryKeyDirectory>, ManualClock, Party, Party) {
    let directory = Arc::new(InMemoryKeyDirectory::with_rng(StdRng::seed_from_u64(7)));
    let clock = ManualClock::new(5_000);
    let mut alice = party(&directory, &clock, "alice");
    let mut bob = party(&directory, &clock, "bob");
    alice.chat.rotate_keys().unwrap();
    bob.chat.rotate_keys().unwrap();
    (directory, clock, alice, bob)
}

/// Alice opens a session with Bob and Bob accepts it
fn handshake(alice: &mut Party, bob: &mut Party) {
    alice.chat.start_new_session_as_sender(&bob.card).unwrap();
    let first = alice.chat.encrypt_string("bob", "hello bob").unwrap();
    assert!(first.is_prekey_message());

    bob.chat.start_new_session_as_receiver(&alice.card, &first).unwrap();
    assert_eq!(bob.chat.decrypt_string("alice", &first).unwrap(), "hello bob");
}

#[test]
fn test_new_rejects_foreign_card() {
    let directory = InMemoryKeyDirectory::new();
    let card = Card::new("alice", IdentityKeyPair::generate().verifying_key());

    let result = SecureChat::new(
        IdentityKeyPair::generate(),
        card,
        Arc::new(directory),
        Arc::new(StaticTokenProvider::new("token")),
        ChatStores::in_memory(),
        RotatorConfig::default(),
        Arc::new(ManualClock::new(0)),
    );
    assert!(matches!(result, Err(ChatError::IdentityKeyMismatch)));
}

#[test]
fn test_sender_receiver_conversation() {
    let (_directory, _clock, mut alice, mut bob) = setup();
    handshake(&mut alice, &mut bob);

    let reply = bob.chat.encrypt_string("alice", "hi alice").unwrap();
    assert!(!reply.is_prekey_message());
    assert_eq!(alice.chat.decrypt_string("bob", &reply).unwrap(), "hi alice");

    // Once a reply was read the prekey header is dropped
    let next = alice.chat.encrypt_string("bob", "how are you?").unwrap();
    assert!(!next.is_prekey_message());
    assert_eq!(bob.chat.decrypt_string("alice", &next).unwrap(), "how are you?");

    let session = alice.chat.existing_session("bob").unwrap().unwrap();
    assert_eq!(session.participant_identity(), "bob");
    assert!(alice.chat.existing_session("carol").unwrap().is_none());
}

#[test]
fn test_random_interleaving() {
    let (_directory, _clock, mut alice, mut bob) = setup();
    handshake(&mut alice, &mut bob);

    let mut rng = StdRng::seed_from_u64(42);
    for i in 0..100 {
        let text = format!("message {i}");
        if rng.gen_bool(0.5) {
            let message = alice.chat.encrypt_string("bob", &text).unwrap();
            assert_eq!(bob.chat.decrypt_string("alice", &message).unwrap(), text);
        } else {
            let message = bob.chat.encrypt_string("alice", &text).unwrap();
            assert_eq!(alice.chat.decrypt_string("bob", &message).unwrap(), text);
        }
    }
}

#[test]
fn test_receiver_orphans_consumed_one_time_key() {
    let (_directory, clock, mut alice, mut bob) = setup();
    assert_eq!(bob.chat.active_one_time_keys_on_server().unwrap(), DESIRED);

    alice.chat.start_new_session_as_sender(&bob.card).unwrap();
    assert_eq!(bob.chat.active_one_time_keys_on_server().unwrap(), DESIRED - 1);

    let first = alice.chat.encrypt("bob", b"payload").unwrap();
    let one_time_id = first.one_time_key_id().unwrap();
    assert!(bob.chat.one_time_keys.retrieve_key(&one_time_id).unwrap().is_available());

    clock.advance(Duration::from_secs(1));
    bob.chat.start_new_session_as_receiver(&alice.card, &first).unwrap();

    let record = bob.chat.one_time_keys.retrieve_key(&one_time_id).unwrap();
    assert_eq!(record.orphaned_from, Some(6_000));

    // The rotator refills the pool and keeps the orphaned key around
    let outcome = bob.chat.rotate_keys().unwrap();
    assert_eq!(outcome.one_time_keys_added, 1);
    assert_eq!(outcome.one_time_keys_orphaned, 0);
    assert_eq!(bob.chat.active_one_time_keys_on_server().unwrap(), DESIRED);
    assert!(bob.chat.one_time_keys.retrieve_key(&one_time_id).is_ok());
}

#[test]
fn test_receiver_keeps_earlier_orphan_timestamp() {
    let (_directory, clock, mut alice, mut bob) = setup();
    alice.chat.start_new_session_as_sender(&bob.card).unwrap();
    let first = alice.chat.encrypt_string("bob", "late delivery").unwrap();
    let one_time_id = first.one_time_key_id().unwrap();

    // Bob rotates before the first message arrives
    bob.chat.rotate_keys().unwrap();
    clock.advance(Duration::from_secs(10));
    bob.chat.start_new_session_as_receiver(&alice.card, &first).unwrap();

    let record = bob.chat.one_time_keys.retrieve_key(&one_time_id).unwrap();
    assert_eq!(record.orphaned_from, Some(5_000));
    assert_eq!(bob.chat.decrypt_string("alice", &first).unwrap(), "late delivery");
}

#[test]
fn test_receiver_without_one_time_key() {
    let directory = Arc::new(InMemoryKeyDirectory::new());
    let clock = ManualClock::new(0);
    let mut alice = party(&directory, &clock, "alice");
    let mut bob = party(&directory, &clock, "bob");
    bob.chat.rotate_keys().unwrap();

    // Drain Bob's pool so the next bundle has no one-time key
    let token = directory.issue_token("mallory").unwrap();
    for _ in 0..DESIRED {
        directory.get_public_key_set("bob", &token).unwrap();
    }

    alice.chat.start_new_session_as_sender(&bob.card).unwrap();
    let first = alice.chat.encrypt_string("bob", "no one-time key").unwrap();
    assert_eq!(first.one_time_key_id(), None);

    bob.chat.start_new_session_as_receiver(&alice.card, &first).unwrap();
    assert_eq!(bob.chat.decrypt_string("alice", &first).unwrap(), "no one-time key");
}

#[test]
fn test_receiver_errors() {
    let (_directory, _clock, mut alice, mut bob) = setup();
    handshake(&mut alice, &mut bob);

    let reply = bob.chat.encrypt_string("alice", "not a first message").unwrap();
    let result = alice.chat.start_new_session_as_receiver(&bob.card, &reply);
    assert!(matches!(result, Err(ChatError::Session(SessionError::NotPrekeyMessage))));

    // Long-term key the receiver never generated
    let mut message = alice.chat.encrypt_string("bob", "unknown key").unwrap();
    if let Some(prekey) = message.prekey.as_mut() {
        prekey.long_term_key_id = KeyId::from_bytes([9; 8]);
    }
    let result = bob.chat.start_new_session_as_receiver(&alice.card, &message);
    assert!(matches!(result, Err(ChatError::Store(StoreError::NotFound(_)))));
}

#[test]
fn test_failed_handshake_keeps_established_session() {
    let (_directory, _clock, mut alice, mut bob) = setup();
    alice.chat.start_new_session_as_sender(&bob.card).unwrap();
    let first = alice.chat.encrypt_string("bob", "hello bob").unwrap();
    bob.chat.start_new_session_as_receiver(&alice.card, &first).unwrap();
    assert_eq!(bob.chat.decrypt_string("alice", &first).unwrap(), "hello bob");
    let reply = bob.chat.encrypt_string("alice", "hi alice").unwrap();
    assert_eq!(alice.chat.decrypt_string("bob", &reply).unwrap(), "hi alice");

    // Receiver side: replayed first message naming an unknown long-term key
    let mut replayed = first.clone();
    if let Some(prekey) = replayed.prekey.as_mut() {
        prekey.long_term_key_id = KeyId::from_bytes([7; 8]);
    }
    assert!(matches!(
        bob.chat.start_new_session_as_receiver(&alice.card, &replayed),
        Err(ChatError::Store(StoreError::NotFound(_)))
    ));
    assert!(matches!(
        bob.chat.start_new_session_as_receiver(&alice.card, &reply),
        Err(ChatError::Session(SessionError::NotPrekeyMessage))
    ));

    // Sender side: directory keys do not match the card
    let impostor = Card::new("bob", IdentityKeyPair::generate().verifying_key());
    assert!(matches!(
        alice.chat.start_new_session_as_sender(&impostor),
        Err(ChatError::IdentityKeyMismatch)
    ));

    let message = alice.chat.encrypt_string("bob", "still here").unwrap();
    assert!(!message.is_prekey_message());
    assert_eq!(bob.chat.decrypt_string("alice", &message).unwrap(), "still here");
    let answer = bob.chat.encrypt_string("alice", "me too").unwrap();
    assert_eq!(alice.chat.decrypt_string("bob", &answer).unwrap(), "me too");
}

#[test]
fn test_sender_rejects_wrong_identity_key() {
    let (_directory, _clock, mut alice, bob) = setup();
    let impostor = Card::new("bob", IdentityKeyPair::generate().verifying_key());

    let result = alice.chat.start_new_session_as_sender(&impostor);
    assert!(matches!(result, Err(ChatError::IdentityKeyMismatch)));
    assert!(alice.chat.existing_session(&bob.card.identity).unwrap().is_none());
}

/// Serves long-term keys signed by an unrelated identity
struct ForgingDirectory {
    inner: Arc<InMemoryKeyDirectory>,
    forger: IdentityKeyPair,
}

impl ForgingDirectory {
    fn forge(&self, mut set: PublicKeySet) -> PublicKeySet {
        set.long_term_public_key = SignedPublicKey::sign(set.long_term_public_key.public_key, &self.forger);
        set
    }
}

impl KeyDirectoryClient for ForgingDirectory {
    fn upload_public_keys(
        &self,
        identity_card_id: Option<&str>,
        long_term_public_key: Option<&SignedPublicKey>,
        one_time_public_keys: &[X25519PublicKey],
        token: &str,
    ) -> Result<(), DirectoryError> {
        self.inner
            .upload_public_keys(identity_card_id, long_term_public_key, one_time_public_keys, token)
    }

    fn get_number_of_active_one_time_public_keys(&self, token: &str) -> Result<usize, DirectoryError> {
        self.inner.get_number_of_active_one_time_public_keys(token)
    }

    fn validate_public_keys(
        &self,
        long_term_key_id: Option<&KeyId>,
        one_time_keys_ids: &[KeyId],
        token: &str,
    ) -> Result<ValidatePublicKeysResponse, DirectoryError> {
        self.inner.validate_public_keys(long_term_key_id, one_time_keys_ids, token)
    }

    fn get_public_key_set(&self, identity: &str, token: &str) -> Result<PublicKeySet, DirectoryError> {
        Ok(self.forge(self.inner.get_public_key_set(identity, token)?))
    }

    fn get_multiple_public_key_sets(
        &self,
        identities: &[&str],
        token: &str,
    ) -> Result<Vec<IdentityPublicKeySet>, DirectoryError> {
        let sets = self.inner.get_multiple_public_key_sets(identities, token)?;
        Ok(sets
            .into_iter()
            .map(|set| IdentityPublicKeySet {
                identity: set.identity,
                public_key_set: self.forge(set.public_key_set),
            })
            .collect())
    }

    fn delete_keys_entity(&self, token: &str) -> Result<(), DirectoryError> {
        self.inner.delete_keys_entity(token)
    }
}

#[test]
fn test_sender_fails_closed_on_bad_signature() {
    let directory = Arc::new(InMemoryKeyDirectory::new());
    let clock = ManualClock::new(0);
    let forging = Arc::new(ForgingDirectory {
        inner: directory.clone(),
        forger: IdentityKeyPair::generate(),
    });

    let mut alice = party_with_client(&directory, forging, &clock, "alice");
    let mut bob = party(&directory, &clock, "bob");
    bob.chat.rotate_keys().unwrap();

    let result = alice.chat.start_new_session_as_sender(&bob.card);
    assert!(matches!(result, Err(ChatError::InvalidLongTermKeySignature)));

    let result = alice.chat.start_multiple_sessions_as_sender(&[bob.card.clone()]);
    assert!(matches!(result, Err(ChatError::InvalidLongTermKeySignature)));
    assert!(alice.chat.existing_session("bob").unwrap().is_none());
}

#[test]
fn test_fresh_handshake_replaces_session() {
    let (_directory, _clock, mut alice, mut bob) = setup();
    handshake(&mut alice, &mut bob);
    let stale = alice.chat.encrypt_string("bob", "old session").unwrap();

    alice.chat.start_new_session_as_sender(&bob.card).unwrap();
    let first = alice.chat.encrypt_string("bob", "new session").unwrap();
    bob.chat.start_new_session_as_receiver(&alice.card, &first).unwrap();
    assert_eq!(bob.chat.decrypt_string("alice", &first).unwrap(), "new session");

    // The replaced session is gone
    assert!(bob.chat.decrypt("alice", &stale).is_err());

    let reply = bob.chat.encrypt_string("alice", "got it").unwrap();
    assert_eq!(alice.chat.decrypt_string("bob", &reply).unwrap(), "got it");
}

#[test]
fn test_failed_decrypt_keeps_session() {
    let (_directory, _clock, mut alice, mut bob) = setup();
    handshake(&mut alice, &mut bob);

    let message = alice.chat.encrypt_string("bob", "intact").unwrap();
    let mut tampered = message.clone();
    tampered.payload.ciphertext[0] ^= 0xff;

    assert!(matches!(
        bob.chat.decrypt("alice", &tampered),
        Err(ChatError::Session(SessionError::Ratchet(_)))
    ));
    assert_eq!(bob.chat.decrypt_string("alice", &message).unwrap(), "intact");
}

#[test]
fn test_multiple_sessions_skip_unpublished_peers() {
    let (directory, clock, mut alice, mut bob) = setup();
    let mut carol = party(&directory, &clock, "carol");
    carol.chat.rotate_keys().unwrap();
    let dave = party(&directory, &clock, "dave");

    let sessions = alice
        .chat
        .start_multiple_sessions_as_sender(&[bob.card.clone(), dave.card.clone(), carol.card.clone()])
        .unwrap();
    let peers: Vec<&str> = sessions.iter().map(SecureSession::participant_identity).collect();
    assert_eq!(peers, vec!["bob", "carol"]);
    assert!(alice.chat.existing_session("dave").unwrap().is_none());

    for peer in [&mut bob, &mut carol] {
        let name = peer.card.identity.clone();
        let first = alice.chat.encrypt_string(&name, "group hello").unwrap();
        peer.chat.start_new_session_as_receiver(&alice.card, &first).unwrap();
        assert_eq!(peer.chat.decrypt_string("alice", &first).unwrap(), "group hello");
    }
}

#[test]
fn test_session_lookup_and_delete() {
    let (_directory, _clock, mut alice, mut bob) = setup();

    assert!(matches!(
        alice.chat.encrypt_string("bob", "too early"),
        Err(ChatError::NoSession(_))
    ));
    assert!(matches!(
        alice.chat.delete_session("bob"),
        Err(ChatError::Store(StoreError::NotFound(_)))
    ));

    handshake(&mut alice, &mut bob);
    alice.chat.delete_session("bob").unwrap();
    assert!(alice.chat.existing_session("bob").unwrap().is_none());
}

#[test]
fn test_reset_then_republish() {
    let (_directory, _clock, mut alice, mut bob) = setup();
    handshake(&mut alice, &mut bob);

    bob.chat.reset().unwrap();
    assert!(bob.chat.existing_session("alice").unwrap().is_none());
    assert!(bob.chat.long_term_keys.retrieve_all_keys().unwrap().is_empty());
    assert!(bob.chat.one_time_keys.retrieve_all_keys().unwrap().is_empty());
    assert!(matches!(
        alice.chat.start_new_session_as_sender(&bob.card),
        Err(ChatError::Directory(DirectoryError::NotFound(_)))
    ));

    let outcome = bob.chat.rotate_keys().unwrap();
    assert!(outcome.card_uploaded);
    assert_eq!(outcome.one_time_keys_added, DESIRED);

    handshake(&mut alice, &mut bob);
}
