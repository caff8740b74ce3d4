//! Double Ratchet state machine
//!
//! Provides forward secrecy and post-compromise security through
//! continuous key ratcheting. Messages must be decrypted in the order
//! they were produced; skipped-key caching is not kept.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::util::serde_hex;

type HmacSha256 = Hmac<Sha256>;

const RATCHET_INFO: &[u8] = b"RatchetCore_Ratchet";
const NONCE_LEN: usize = 12;

/// Chain key for symmetric ratchet
#[derive(Clone, Serialize, Deserialize)]
struct ChainKey {
    #[serde(with = "serde_hex::array32")]
    key: [u8; 32],
    index: u32,
}

impl ChainKey {
    fn new(key: [u8; 32]) -> Self {
        Self { key, index: 0 }
    }

    /// Derive message key and advance chain
    fn next(&mut self) -> Result<Zeroizing<[u8; 32]>, RatchetError> {
        let message_key = self.derive_key(0x01)?;
        self.key = *self.derive_key(0x02)?;
        self.index += 1;
        Ok(message_key)
    }

    fn derive_key(&self, constant: u8) -> Result<Zeroizing<[u8; 32]>, RatchetError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key)
            .map_err(|_| RatchetError::KeyDerivationFailed)?;
        mac.update(&[constant]);
        let result = mac.finalize().into_bytes();
        let mut output = Zeroizing::new([0u8; 32]);
        output.copy_from_slice(&result);
        Ok(output)
    }
}

impl Drop for ChainKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Double Ratchet state
#[derive(Clone)]
pub struct DoubleRatchet {
    /// DH ratchet key pair
    dh_private: StaticSecret,
    dh_public: X25519PublicKey,
    /// Remote party's DH public key
    remote_public: Option<X25519PublicKey>,
    root_key: [u8; 32],
    sending_chain: Option<ChainKey>,
    receiving_chain: Option<ChainKey>,
    /// Previous sending chain length
    prev_send_count: u32,
    /// Bound into every AEAD operation together with the header
    associated_data: Vec<u8>,
}

impl DoubleRatchet {
    /// Initialize as the sender with the shared secret from X3DH
    pub fn init_sender(
        shared_secret: &[u8; 32],
        remote_public: &X25519PublicKey,
        associated_data: Vec<u8>,
    ) -> Result<Self, RatchetError> {
        let dh_private = StaticSecret::random_from_rng(OsRng);
        let dh_public = X25519PublicKey::from(&dh_private);

        let dh_output = dh_private.diffie_hellman(remote_public);
        let (root_key, chain_key) = Self::kdf_rk(shared_secret, dh_output.as_bytes())?;

        Ok(Self {
            dh_private,
            dh_public,
            remote_public: Some(*remote_public),
            root_key,
            sending_chain: Some(ChainKey::new(chain_key)),
            receiving_chain: None,
            prev_send_count: 0,
            associated_data,
        })
    }

    /// Initialize as the receiver with the shared secret from X3DH.
    ///
    /// Takes the sender's first ratchet key and performs the initial DH
    /// ratchet immediately, so the receiver can both send and receive.
    pub fn init_receiver(
        shared_secret: &[u8; 32],
        long_term_prekey: &StaticSecret,
        sender_ratchet_key: &X25519PublicKey,
        associated_data: Vec<u8>,
    ) -> Result<Self, RatchetError> {
        let mut ratchet = Self {
            dh_private: long_term_prekey.clone(),
            dh_public: X25519PublicKey::from(long_term_prekey),
            remote_public: None,
            root_key: *shared_secret,
            sending_chain: None,
            receiving_chain: None,
            prev_send_count: 0,
            associated_data,
        };

        ratchet.dh_ratchet(sender_ratchet_key)?;

        Ok(ratchet)
    }

    /// Get our current DH public key
    pub fn public_key(&self) -> X25519PublicKey {
        self.dh_public
    }

    /// Encrypt a message
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedPayload, RatchetError> {
        let chain = self
            .sending_chain
            .as_mut()
            .ok_or(RatchetError::NotInitialized)?;

        let header = MessageHeader {
            dh_public: self.dh_public,
            prev_chain_length: self.prev_send_count,
            message_number: chain.index,
        };
        let message_key = chain.next()?;
        let aad = Self::aad(&self.associated_data, &header);
        let ciphertext = Self::aead_encrypt(&message_key, plaintext, &aad)?;

        Ok(EncryptedPayload { header, ciphertext })
    }

    /// Decrypt a message.
    ///
    /// Runs on a copy of the state and commits only on success, so a
    /// rejected message leaves the ratchet untouched.
    pub fn decrypt(&mut self, payload: &EncryptedPayload) -> Result<Vec<u8>, RatchetError> {
        let mut next = self.clone();
        let plaintext = next.decrypt_in_place(payload)?;
        *self = next;
        Ok(plaintext)
    }

    fn decrypt_in_place(&mut self, payload: &EncryptedPayload) -> Result<Vec<u8>, RatchetError> {
        let header = &payload.header;
        let need_ratchet = self
            .remote_public
            .map(|pk| pk != header.dh_public)
            .unwrap_or(true);

        if need_ratchet {
            let received = self.receiving_chain.as_ref().map(|c| c.index).unwrap_or(0);
            if header.prev_chain_length != received {
                return Err(RatchetError::OutOfOrder);
            }
            self.dh_ratchet(&header.dh_public)?;
        }

        let chain = self
            .receiving_chain
            .as_mut()
            .ok_or(RatchetError::NotInitialized)?;
        if header.message_number != chain.index {
            return Err(RatchetError::OutOfOrder);
        }

        let message_key = chain.next()?;
        let aad = Self::aad(&self.associated_data, header);
        Self::aead_decrypt(&message_key, &payload.ciphertext, &aad)
    }

    /// Perform DH ratchet step
    fn dh_ratchet(&mut self, their_public: &X25519PublicKey) -> Result<(), RatchetError> {
        self.remote_public = Some(*their_public);
        self.prev_send_count = self.sending_chain.as_ref().map(|c| c.index).unwrap_or(0);

        let dh_recv = self.dh_private.diffie_hellman(their_public);
        let (root_key, recv_chain_key) = Self::kdf_rk(&self.root_key, dh_recv.as_bytes())?;
        self.root_key = root_key;
        self.receiving_chain = Some(ChainKey::new(recv_chain_key));

        self.dh_private = StaticSecret::random_from_rng(OsRng);
        self.dh_public = X25519PublicKey::from(&self.dh_private);

        let dh_send = self.dh_private.diffie_hellman(their_public);
        let (root_key, send_chain_key) = Self::kdf_rk(&self.root_key, dh_send.as_bytes())?;
        self.root_key = root_key;
        self.sending_chain = Some(ChainKey::new(send_chain_key));

        Ok(())
    }

    /// Root key derivation function
    fn kdf_rk(root_key: &[u8; 32], dh_output: &[u8]) -> Result<([u8; 32], [u8; 32]), RatchetError> {
        let hk = Hkdf::<Sha256>::new(Some(root_key), dh_output);
        let mut output = Zeroizing::new([0u8; 64]);
        hk.expand(RATCHET_INFO, &mut output[..])
            .map_err(|_| RatchetError::KeyDerivationFailed)?;

        let mut new_root = [0u8; 32];
        let mut chain_key = [0u8; 32];
        new_root.copy_from_slice(&output[..32]);
        chain_key.copy_from_slice(&output[32..]);

        Ok((new_root, chain_key))
    }

    fn aad(associated_data: &[u8], header: &MessageHeader) -> Vec<u8> {
        let mut aad = Vec::with_capacity(associated_data.len() + 40);
        aad.extend_from_slice(associated_data);
        aad.extend_from_slice(&header.to_bytes());
        aad
    }

    /// AEAD encryption using AES-256-GCM, nonce prepended
    fn aead_encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, RatchetError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| RatchetError::EncryptionFailed)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|_| RatchetError::EncryptionFailed)?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend(ciphertext);

        Ok(result)
    }

    /// AEAD decryption using AES-256-GCM
    fn aead_decrypt(key: &[u8; 32], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, RatchetError> {
        if ciphertext.len() < NONCE_LEN {
            return Err(RatchetError::DecryptionFailed);
        }

        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| RatchetError::DecryptionFailed)?;

        let nonce = Nonce::from_slice(&ciphertext[..NONCE_LEN]);
        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &ciphertext[NONCE_LEN..],
                    aad,
                },
            )
            .map_err(|_| RatchetError::DecryptionFailed)
    }

    /// Serialize the full ratchet state
    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>, RatchetError> {
        serde_json::to_vec(self)
            .map(Zeroizing::new)
            .map_err(|_| RatchetError::Serialization)
    }

    /// Restore a ratchet from `to_bytes` output
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RatchetError> {
        serde_json::from_slice(bytes).map_err(|_| RatchetError::Serialization)
    }
}

impl Drop for DoubleRatchet {
    fn drop(&mut self) {
        self.root_key.zeroize();
    }
}

impl Serialize for DoubleRatchet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RatchetState::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DoubleRatchet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        RatchetState::deserialize(deserializer).map(|state| Self::from(&state))
    }
}

/// Persisted form of `DoubleRatchet`
#[derive(Serialize, Deserialize)]
struct RatchetState {
    #[serde(with = "serde_hex::array32")]
    dh_private: [u8; 32],
    #[serde(with = "serde_hex::option_array32")]
    remote_public: Option<[u8; 32]>,
    #[serde(with = "serde_hex::array32")]
    root_key: [u8; 32],
    sending_chain: Option<ChainKey>,
    receiving_chain: Option<ChainKey>,
    prev_send_count: u32,
    #[serde(with = "serde_hex")]
    associated_data: Vec<u8>,
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.dh_private.zeroize();
        self.root_key.zeroize();
    }
}

impl From<&DoubleRatchet> for RatchetState {
    fn from(ratchet: &DoubleRatchet) -> Self {
        Self {
            dh_private: ratchet.dh_private.to_bytes(),
            remote_public: ratchet.remote_public.map(|pk| pk.to_bytes()),
            root_key: ratchet.root_key,
            sending_chain: ratchet.sending_chain.clone(),
            receiving_chain: ratchet.receiving_chain.clone(),
            prev_send_count: ratchet.prev_send_count,
            associated_data: ratchet.associated_data.clone(),
        }
    }
}

impl From<&RatchetState> for DoubleRatchet {
    fn from(state: &RatchetState) -> Self {
        let dh_private = StaticSecret::from(state.dh_private);
        let dh_public = X25519PublicKey::from(&dh_private);

        Self {
            dh_private,
            dh_public,
            remote_public: state.remote_public.map(X25519PublicKey::from),
            root_key: state.root_key,
            sending_chain: state.sending_chain.clone(),
            receiving_chain: state.receiving_chain.clone(),
            prev_send_count: state.prev_send_count,
            associated_data: state.associated_data.clone(),
        }
    }
}

/// Message header
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's current DH public key
    #[serde(with = "serde_hex::x25519")]
    pub dh_public: X25519PublicKey,
    /// Previous sending chain length
    pub prev_chain_length: u32,
    /// Message number in current chain
    pub message_number: u32,
}

impl MessageHeader {
    /// Canonical encoding bound into the AEAD associated data
    pub fn to_bytes(&self) -> [u8; 40] {
        let mut bytes = [0u8; 40];
        bytes[..32].copy_from_slice(self.dh_public.as_bytes());
        bytes[32..36].copy_from_slice(&self.prev_chain_length.to_be_bytes());
        bytes[36..].copy_from_slice(&self.message_number.to_be_bytes());
        bytes
    }
}

/// Encrypted message payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub header: MessageHeader,
    #[serde(with = "serde_hex")]
    pub ciphertext: Vec<u8>,
}

/// Ratchet errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RatchetError {
    #[error("Ratchet not initialized")]
    NotInitialized,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Message out of order")]
    OutOfOrder,
    #[error("Ratchet state serialization failed")]
    Serialization,
}
