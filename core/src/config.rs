//! Key rotation and storage configuration

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::directory::MAX_ONE_TIME_KEYS;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Lifetimes and pool size the rotator enforces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotatorConfig {
    /// How long an orphaned one-time key is kept before deletion
    #[serde(rename = "orphaned_one_time_key_ttl_secs", with = "duration_secs")]
    pub orphaned_one_time_key_ttl: Duration,

    /// Age at which the active long-term key is replaced
    #[serde(rename = "long_term_key_ttl_secs", with = "duration_secs")]
    pub long_term_key_ttl: Duration,

    /// How long a replaced long-term key is kept before deletion
    #[serde(rename = "outdated_long_term_key_ttl_secs", with = "duration_secs")]
    pub outdated_long_term_key_ttl: Duration,

    /// Size of the one-time key pool kept on the directory
    pub desired_number_of_one_time_keys: usize,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            orphaned_one_time_key_ttl: DAY,
            long_term_key_ttl: 5 * DAY,
            outdated_long_term_key_ttl: DAY,
            desired_number_of_one_time_keys: 100,
        }
    }
}

impl RotatorConfig {
    /// Same TTL for every key class
    pub fn uniform(ttl: Duration, desired_number_of_one_time_keys: usize) -> Self {
        Self {
            orphaned_one_time_key_ttl: ttl,
            long_term_key_ttl: ttl,
            outdated_long_term_key_ttl: ttl,
            desired_number_of_one_time_keys,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.desired_number_of_one_time_keys > MAX_ONE_TIME_KEYS {
            return Err(ConfigError::Invalid(format!(
                "desired_number_of_one_time_keys must not exceed {MAX_ONE_TIME_KEYS}"
            )));
        }
        Ok(())
    }

    /// Parse and validate a JSON document (TTLs in seconds)
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }
}

/// Where the file-backed stores keep their data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory; every identity gets its own subdirectory
    pub root: PathBuf,
}

impl StorageConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding everything stored for `identity`
    pub fn identity_dir(&self, identity: &str) -> PathBuf {
        self.root.join(hex::encode(identity.as_bytes()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
