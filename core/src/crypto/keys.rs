//! Cryptographic key types for the ratchet handshake
//!
//! Provides the identity key, signed long-term prekeys, one-time prekeys,
//! the published prekey bundle and the short key identifier.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Length of a key identifier in bytes
pub const KEY_ID_LEN: usize = 8;

/// Short identifier of a published public key.
///
/// `id = SHA-512(public key)[0..8]`. Client and directory must agree on this
/// bit for bit, so it is the only way ids are ever produced.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyId([u8; KEY_ID_LEN]);

impl KeyId {
    /// Compute the identifier of an exported public key
    pub fn compute(public_key: &[u8]) -> Self {
        let digest = Sha512::digest(public_key);
        let mut id = [0u8; KEY_ID_LEN];
        id.copy_from_slice(&digest[..KEY_ID_LEN]);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; KEY_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let id: [u8; KEY_ID_LEN] = bytes.try_into().map_err(|_| KeyError::InvalidFormat)?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", hex::encode(self.0))
    }
}

impl From<KeyId> for String {
    fn from(id: KeyId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for KeyId {
    type Error = KeyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidFormat)?;
        Self::from_slice(&bytes)
    }
}

/// Convert a published Ed25519 identity key into its X25519 form
pub fn identity_exchange_key(verifying_key: &VerifyingKey) -> X25519PublicKey {
    X25519PublicKey::from(verifying_key.to_montgomery().to_bytes())
}

/// Identity key pair (Ed25519 for signing, X25519 for key exchange)
#[derive(Clone)]
pub struct IdentityKeyPair {
    /// Ed25519 signing key
    signing_key: SigningKey,
    /// X25519 private key (birationally mapped from the signing key)
    x25519_private: StaticSecret,
    /// X25519 public key
    x25519_public: X25519PublicKey,
}

impl IdentityKeyPair {
    /// Generate a new identity key pair
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Wrap an existing Ed25519 signing key.
    ///
    /// The exchange key is derived so that its public half equals
    /// `identity_exchange_key(&self.verifying_key())`.
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let x25519_private = StaticSecret::from(signing_key.to_scalar_bytes());
        let x25519_public = X25519PublicKey::from(&x25519_private);

        Self {
            signing_key,
            x25519_private,
            x25519_public,
        }
    }

    /// Get the Ed25519 public key for verification
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Get the X25519 public key for key exchange
    pub fn public_key(&self) -> X25519PublicKey {
        self.x25519_public
    }

    pub(crate) fn private_key(&self) -> &StaticSecret {
        &self.x25519_private
    }

    /// Sign data with Ed25519
    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }

    /// Serialize the signing seed (for storage)
    pub fn to_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Deserialize from a signing seed
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let seed: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidFormat)?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&seed)))
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("verifying_key", &hex::encode(self.verifying_key().as_bytes()))
            .finish_non_exhaustive()
    }
}

/// X25519 key pair backing both long-term and one-time prekeys
#[derive(Clone)]
pub struct PreKeyPair {
    private_key: StaticSecret,
    public_key: X25519PublicKey,
}

impl PreKeyPair {
    pub fn generate() -> Self {
        let private_key = StaticSecret::random_from_rng(OsRng);
        let public_key = X25519PublicKey::from(&private_key);

        Self {
            private_key,
            public_key,
        }
    }

    /// Restore from stored private key material
    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let private: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidFormat)?;
        let private_key = StaticSecret::from(private);
        let public_key = X25519PublicKey::from(&private_key);

        Ok(Self {
            private_key,
            public_key,
        })
    }

    pub fn public_key(&self) -> X25519PublicKey {
        self.public_key
    }

    /// Exported public key, the input of `KeyId::compute`
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public_key.to_bytes()
    }

    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.private_key.to_bytes())
    }

    pub fn key_id(&self) -> KeyId {
        KeyId::compute(self.public_key.as_bytes())
    }

    pub(crate) fn private_key(&self) -> &StaticSecret {
        &self.private_key
    }
}

/// Long-term prekey (medium-lived, signed by the identity key)
#[derive(Clone)]
pub struct SignedPreKey {
    key_pair: PreKeyPair,
    /// Signature from identity key over the exported public key
    signature: Signature,
}

impl SignedPreKey {
    /// Generate a new signed prekey
    pub fn generate(identity: &IdentityKeyPair) -> Self {
        Self::sign(PreKeyPair::generate(), identity)
    }

    /// Sign an existing key pair with the identity key
    pub fn sign(key_pair: PreKeyPair, identity: &IdentityKeyPair) -> Self {
        let signature = identity.sign(key_pair.public_key().as_bytes());

        Self {
            key_pair,
            signature,
        }
    }

    pub fn key_pair(&self) -> &PreKeyPair {
        &self.key_pair
    }

    pub fn public_key(&self) -> X25519PublicKey {
        self.key_pair.public_key()
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    pub fn key_id(&self) -> KeyId {
        self.key_pair.key_id()
    }

    /// Verify signature against identity public key
    pub fn verify(&self, identity_public: &VerifyingKey) -> bool {
        identity_public
            .verify(self.public_key().as_bytes(), &self.signature)
            .is_ok()
    }
}

/// Parsed public bundle a sender needs to start a session
#[derive(Clone, Debug)]
pub struct PreKeyBundle {
    /// Identity verifying key (Ed25519)
    pub identity_verifying_key: VerifyingKey,
    /// Signed long-term prekey
    pub signed_prekey: X25519PublicKey,
    pub signed_prekey_signature: Signature,
    /// Optional one-time prekey
    pub one_time_prekey: Option<X25519PublicKey>,
}

impl PreKeyBundle {
    /// Create a bundle from our keys
    pub fn new(
        identity: &IdentityKeyPair,
        signed_prekey: &SignedPreKey,
        one_time_prekey: Option<&PreKeyPair>,
    ) -> Self {
        Self {
            identity_verifying_key: identity.verifying_key(),
            signed_prekey: signed_prekey.public_key(),
            signed_prekey_signature: signed_prekey.signature(),
            one_time_prekey: one_time_prekey.map(PreKeyPair::public_key),
        }
    }

    /// Identity public key in its X25519 form
    pub fn identity_key(&self) -> X25519PublicKey {
        identity_exchange_key(&self.identity_verifying_key)
    }

    pub fn signed_prekey_id(&self) -> KeyId {
        KeyId::compute(self.signed_prekey.as_bytes())
    }

    pub fn one_time_prekey_id(&self) -> Option<KeyId> {
        self.one_time_prekey
            .as_ref()
            .map(|key| KeyId::compute(key.as_bytes()))
    }

    /// Verify the signed prekey signature
    pub fn verify(&self) -> Result<(), KeyError> {
        self.identity_verifying_key
            .verify(self.signed_prekey.as_bytes(), &self.signed_prekey_signature)
            .map_err(|_| KeyError::SignatureInvalid)
    }
}

/// Key-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid key format")]
    InvalidFormat,
    #[error("Signature verification failed")]
    SignatureInvalid,
}
