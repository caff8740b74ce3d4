//! Ratchet demo CLI - two parties talking through an in-memory key directory
//!
//! Usage: ratchet-demo [STORAGE_DIR]
//! With a storage directory, keys and sessions are kept on disk.

use std::sync::Arc;
use std::time::Duration;

use ratchet_core::{
    init_fmt_logger, Card, ChatError, ChatStores, Clock, IdentityKeyPair, InMemoryKeyDirectory, KeyDirectoryClient,
    ManualClock, RotatorConfig, SecureChat, StaticTokenProvider, StorageConfig,
};

struct Party {
    chat: SecureChat,
    card: Card,
}

fn party(
    name: &str,
    directory: &Arc<InMemoryKeyDirectory>,
    storage: Option<&StorageConfig>,
    clock: &ManualClock,
) -> Result<Party, Box<dyn std::error::Error>> {
    let identity = IdentityKeyPair::generate();
    let card = Card::new(name, identity.verifying_key());
    directory.register_card(card.clone())?;
    let token = directory.issue_token(name)?;

    let stores = match storage {
        Some(config) => ChatStores::open(config, name)?,
        None => ChatStores::in_memory(),
    };

    let client: Arc<dyn KeyDirectoryClient> = directory.clone();
    let chat = SecureChat::new(
        identity,
        card.clone(),
        client,
        Arc::new(StaticTokenProvider::new(token)),
        stores,
        RotatorConfig::uniform(Duration::from_secs(3600), 10),
        Arc::new(clock.clone()),
    )?;

    println!("{:<6} card {}  fingerprint {}", name, &card.id[..16], card.fingerprint());
    Ok(Party { chat, card })
}

fn exchange(from: &mut Party, to: &mut Party, text: &str) -> Result<(), ChatError> {
    let message = from.chat.encrypt_string(&to.card.identity, text)?;
    let received = to.chat.decrypt_string(&from.card.identity, &message)?;
    println!("[{} -> {}] {}", from.card.identity, to.card.identity, received);
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let storage = std::env::args().nth(1).map(StorageConfig::new);
    if let Some(config) = &storage {
        println!("Storing keys under {}", config.root.display());
    }

    let directory = Arc::new(InMemoryKeyDirectory::new());
    let clock = ManualClock::new(ratchet_core::SystemClock.now_ms());

    let mut alice = party("alice", &directory, storage.as_ref(), &clock)?;
    let mut bob = party("bob", &directory, storage.as_ref(), &clock)?;

    println!("\n--- Key rotation ---");
    for p in [&mut alice, &mut bob] {
        let outcome = p.chat.rotate_keys()?;
        println!(
            "[ROTATE] {}: long-term={:?} one-time added={} on server={}",
            p.card.identity,
            outcome.new_long_term_key,
            outcome.one_time_keys_added,
            p.chat.active_one_time_keys_on_server()?
        );
    }

    println!("\n--- Handshake ---");
    alice.chat.start_new_session_as_sender(&bob.card)?;
    let first = alice.chat.encrypt_string("bob", "Hey Bob, can you see this?")?;
    println!(
        "[SEND] alice -> bob prekey message (long-term {:?}, one-time {:?})",
        first.long_term_key_id(),
        first.one_time_key_id()
    );

    bob.chat.start_new_session_as_receiver(&alice.card, &first)?;
    println!("[RECV] bob: {}", bob.chat.decrypt_string("alice", &first)?);

    println!("\n--- Conversation ---");
    exchange(&mut bob, &mut alice, "Yes I can! This is encrypted!")?;
    exchange(&mut alice, &mut bob, "Great, the ratchet is turning.")?;
    exchange(&mut alice, &mut bob, "Two in a row.")?;
    exchange(&mut bob, &mut alice, "Received both.")?;

    println!("\n--- Next day ---");
    clock.advance(Duration::from_secs(2 * 3600));
    let outcome = bob.chat.rotate_keys()?;
    println!(
        "[ROTATE] bob: outdated={} orphaned={} new long-term={:?} one-time added={}",
        outcome.long_term_keys_outdated,
        outcome.one_time_keys_orphaned,
        outcome.new_long_term_key,
        outcome.one_time_keys_added
    );
    exchange(&mut alice, &mut bob, "Sessions survive key rotation.")?;

    Ok(())
}

fn main() {
    init_fmt_logger("info");

    println!("=== Ratchet Demo ===\n");
    if let Err(e) = run() {
        eprintln!("Demo failed: {}", e);
        std::process::exit(1);
    }
}
