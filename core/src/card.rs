//! Identity card: the PKI entry binding an identity string to its
//! Ed25519 public key

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::util::serde_hex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    /// Card id, `hex(SHA-256(public key))`
    pub id: String,
    pub identity: String,
    #[serde(with = "serde_hex::verifying_key")]
    pub public_key: VerifyingKey,
}

impl Card {
    pub fn new(identity: impl Into<String>, public_key: VerifyingKey) -> Self {
        Self {
            id: hex::encode(Sha256::digest(public_key.as_bytes())),
            identity: identity.into(),
            public_key,
        }
    }

    /// Human-readable fingerprint, e.g. "A1B2-C3D4-E5F6-0718"
    pub fn fingerprint(&self) -> String {
        let hex_chars: Vec<char> = self.id.to_uppercase().chars().take(16).collect();
        let chunks: Vec<String> = hex_chars
            .chunks(4)
            .map(|c| c.iter().collect())
            .collect();
        chunks.join("-")
    }
}
