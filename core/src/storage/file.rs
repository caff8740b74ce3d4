//! File-backed stores
//!
//! Layout under `StorageConfig::identity_dir(identity)`:
//!
//! ```text
//! long_term_keys.json
//! one_time_keys.json
//! sessions/<hex(peer identity)>.json
//! ```
//!
//! Every write goes to a temporary sibling first and is renamed into place,
//! so a crash leaves either the old or the new file.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::crypto::{KeyId, SecureSession};

use super::{LongTermKey, LongTermKeyStore, OneTimeKey, OneTimeKeyStore, SessionStore, StoreError};

const LONG_TERM_KEYS_FILE: &str = "long_term_keys.json";
const ONE_TIME_KEYS_FILE: &str = "one_time_keys.json";
const SESSIONS_DIR: &str = "sessions";

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Corrupted(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp)?;
    file.write_all(content)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// All key records of one kind, cached in memory and rewritten on change
struct RecordFile<R> {
    path: PathBuf,
    records: BTreeMap<KeyId, R>,
}

impl<R: Serialize + DeserializeOwned + Clone> RecordFile<R> {
    fn open(path: PathBuf) -> Result<Self, StoreError> {
        let records = match read_optional(&path)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => BTreeMap::new(),
        };
        Ok(Self { path, records })
    }

    /// Write `records` and adopt them only once the write succeeded
    fn commit(&mut self, records: BTreeMap<KeyId, R>) -> Result<(), StoreError> {
        write_atomic(&self.path, &serde_json::to_vec_pretty(&records)?)?;
        self.records = records;
        Ok(())
    }

    fn insert(&mut self, id: KeyId, record: R) -> Result<R, StoreError> {
        if self.records.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        let mut records = self.records.clone();
        records.insert(id, record.clone());
        self.commit(records)?;
        Ok(record)
    }

    fn get(&self, id: &KeyId) -> Result<R, StoreError> {
        self.records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn remove(&mut self, id: &KeyId) -> Result<(), StoreError> {
        let mut records = self.records.clone();
        records
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.commit(records)
    }

    fn update(&mut self, id: &KeyId, apply: impl FnOnce(&mut R)) -> Result<(), StoreError> {
        let mut records = self.records.clone();
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply(record);
        self.commit(records)
    }

    fn all(&self) -> Vec<R> {
        self.records.values().cloned().collect()
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.records.clear();
        Ok(())
    }
}

pub struct FileLongTermKeyStore {
    file: RecordFile<LongTermKey>,
}

impl FileLongTermKeyStore {
    pub fn open(config: &StorageConfig, identity: &str) -> Result<Self, StoreError> {
        let file = RecordFile::open(config.identity_dir(identity).join(LONG_TERM_KEYS_FILE))?;
        debug!("Loaded {} long-term keys for {}", file.records.len(), identity);
        Ok(Self { file })
    }
}

impl LongTermKeyStore for FileLongTermKeyStore {
    fn store_key(&mut self, key: &[u8], id: KeyId, created_at: u64) -> Result<LongTermKey, StoreError> {
        self.file.insert(
            id,
            LongTermKey {
                identifier: id,
                key: key.to_vec(),
                created_at,
                outdated_from: None,
            },
        )
    }

    fn retrieve_key(&self, id: &KeyId) -> Result<LongTermKey, StoreError> {
        self.file.get(id)
    }

    fn delete_key(&mut self, id: &KeyId) -> Result<(), StoreError> {
        self.file.remove(id)
    }

    fn retrieve_all_keys(&self) -> Result<Vec<LongTermKey>, StoreError> {
        Ok(self.file.all())
    }

    fn mark_key_outdated(&mut self, id: &KeyId, outdated_from: u64) -> Result<(), StoreError> {
        self.file
            .update(id, |record| record.outdated_from = Some(outdated_from))
    }

    fn reset(&mut self) -> Result<(), StoreError> {
        self.file.clear()
    }
}

pub struct FileOneTimeKeyStore {
    file: RecordFile<OneTimeKey>,
}

impl FileOneTimeKeyStore {
    pub fn open(config: &StorageConfig, identity: &str) -> Result<Self, StoreError> {
        let file = RecordFile::open(config.identity_dir(identity).join(ONE_TIME_KEYS_FILE))?;
        debug!("Loaded {} one-time keys for {}", file.records.len(), identity);
        Ok(Self { file })
    }
}

impl OneTimeKeyStore for FileOneTimeKeyStore {
    fn store_key(&mut self, key: &[u8], id: KeyId) -> Result<OneTimeKey, StoreError> {
        self.file.insert(
            id,
            OneTimeKey {
                identifier: id,
                key: key.to_vec(),
                orphaned_from: None,
            },
        )
    }

    fn retrieve_key(&self, id: &KeyId) -> Result<OneTimeKey, StoreError> {
        self.file.get(id)
    }

    fn delete_key(&mut self, id: &KeyId) -> Result<(), StoreError> {
        self.file.remove(id)
    }

    fn retrieve_all_keys(&self) -> Result<Vec<OneTimeKey>, StoreError> {
        Ok(self.file.all())
    }

    fn mark_key_orphaned(&mut self, id: &KeyId, orphaned_from: u64) -> Result<(), StoreError> {
        self.file
            .update(id, |record| record.orphaned_from = Some(orphaned_from))
    }

    fn reset(&mut self) -> Result<(), StoreError> {
        self.file.clear()
    }
}

/// One JSON file per peer session
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn open(config: &StorageConfig, identity: &str) -> Result<Self, StoreError> {
        let dir = config.identity_dir(identity).join(SESSIONS_DIR);
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn session_path(&self, participant_identity: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", hex::encode(participant_identity.as_bytes())))
    }
}

impl SessionStore for FileSessionStore {
    fn store_session(&mut self, session: &SecureSession) -> Result<(), StoreError> {
        let bytes = session
            .to_bytes()
            .map_err(|e| StoreError::Corrupted(e.to_string()))?;
        write_atomic(&self.session_path(session.participant_identity()), &bytes)
    }

    fn retrieve_session(&self, participant_identity: &str) -> Result<Option<SecureSession>, StoreError> {
        read_optional(&self.session_path(participant_identity))?
            .map(|bytes| {
                SecureSession::from_bytes(&bytes)
                    .map_err(|e| StoreError::Corrupted(format!("{participant_identity}: {e}")))
            })
            .transpose()
    }

    fn delete_session(&mut self, participant_identity: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.session_path(participant_identity)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(participant_identity.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn reset(&mut self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.dir)?;
        info!("Removed all sessions under {}", self.dir.display());
        Ok(())
    }
}
