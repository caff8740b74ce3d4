//! Reference ratchet engine
//!
//! Provides:
//! - Identity, long-term and one-time prekeys with their key ids
//! - X3DH (Extended Triple Diffie-Hellman) key agreement
//! - Double Ratchet for message encryption
//! - Serializable sessions

pub mod keys;
pub mod ratchet;
pub mod session;
pub mod x3dh;

pub use keys::{
    identity_exchange_key, IdentityKeyPair, KeyError, KeyId, PreKeyBundle, PreKeyPair,
    SignedPreKey,
};
pub use ratchet::{DoubleRatchet, EncryptedPayload, MessageHeader, RatchetError};
pub use session::{PrekeyHeader, RatchetMessage, SecureSession, SessionError};
pub use x3dh::{X3DHError, X3DHSession};
