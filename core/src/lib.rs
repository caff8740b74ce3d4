//! Ratchet Core Library
//!
//! Key lifecycle and session establishment for Double-Ratchet messaging:
//! prekey rotation against a key directory, session start as sender or
//! receiver, and persistent per-peer ratchet sessions.

pub mod card;
pub mod chat;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod logger;
pub mod rotator;
pub mod storage;
pub(crate) mod util;

// Re-export logger types
pub use logger::{init_fmt_logger, init_logger, CoreLogger};

pub use card::Card;
pub use chat::{ChatError, ChatStores, SecureChat};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, RotatorConfig, StorageConfig};

// Re-export crypto types
pub use crypto::{IdentityKeyPair, KeyId, PreKeyBundle, PreKeyPair, SignedPreKey};
pub use crypto::{RatchetMessage, SecureSession, SessionError};

pub use directory::{
    AccessTokenProvider, DirectoryError, InMemoryKeyDirectory, KeyDirectoryClient, PublicKeySet,
    SignedPublicKey, StaticTokenProvider, ValidatePublicKeysResponse, MAX_ONE_TIME_KEYS,
};
pub use rotator::{KeysRotator, RotationError, RotationOutcome};
pub use storage::{LongTermKey, LongTermKeyStore, OneTimeKey, OneTimeKeyStore, SessionStore, StoreError};
