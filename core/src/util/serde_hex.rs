//! Hex serialization helpers for serde
use serde::Deserialize;

pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&hex::encode(bytes))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    hex::decode(s).map_err(serde::de::Error::custom)
}

fn decode_array<const N: usize, E: serde::de::Error>(s: &str) -> Result<[u8; N], E> {
    let bytes = hex::decode(s).map_err(E::custom)?;
    bytes
        .try_into()
        .map_err(|_| E::custom(format!("expected {N} bytes")))
}

pub mod array32 {
    use super::*;

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        decode_array(&s)
    }
}

pub mod option_array32 {
    use super::*;

    pub fn serialize<S>(bytes: &Option<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 32]>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| decode_array(&s))
            .transpose()
    }
}

pub mod x25519 {
    use super::*;
    use x25519_dalek::PublicKey;

    pub fn serialize<S>(key: &PublicKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode(key.as_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PublicKey, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let array = decode_array::<32, D::Error>(&s)?;
        Ok(PublicKey::from(array))
    }
}

pub mod verifying_key {
    use super::*;
    use ed25519_dalek::VerifyingKey;

    pub fn serialize<S>(key: &VerifyingKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode(key.as_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<VerifyingKey, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let array = decode_array::<32, D::Error>(&s)?;
        VerifyingKey::from_bytes(&array).map_err(serde::de::Error::custom)
    }
}

pub mod signature {
    use super::*;
    use ed25519_dalek::Signature;

    pub fn serialize<S>(signature: &Signature, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode(signature.to_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Signature, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let array = decode_array::<64, D::Error>(&s)?;
        Ok(Signature::from_bytes(&array))
    }
}

pub mod option_x25519 {
    use x25519_dalek::PublicKey;

    pub fn serialize<S>(key: &Option<PublicKey>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        super::option_array32::serialize(&key.map(|k| k.to_bytes()), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<PublicKey>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = super::option_array32::deserialize(deserializer)?;
        Ok(bytes.map(PublicKey::from))
    }
}
