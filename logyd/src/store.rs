//! Durable per-device configuration.
//!
//! Every device identity gets its own JSON document in the state directory.
//! Writes go to a temporary file next to the target which is synced and then
//! renamed over it, so a crash at any point leaves either the old or the new
//! document behind.

use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::settings::{Setting, SettingValue};

const ENTRY_EXTENSION: &str = "json";
const TEMP_SUFFIX: &str = ".tmp";

/// What is remembered about a device between runs.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct StoreEntry {
    /// The last known display name.
    #[serde(default)]
    pub name: String,

    /// The wireless product ID the settings were made for.
    pub wpid: u16,

    #[serde(default)]
    pub settings: BTreeMap<Setting, SettingValue>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("'{0}' cannot be used as a file name")]
    InvalidIdentity(String),

    #[error("could not write the entry of {identity}")]
    Write {
        identity: String,
        source: io::Error,
    },

    #[error("could not serialize the entry of {identity}")]
    Serialize {
        identity: String,
        source: serde_json::Error,
    },

    #[error("could not create the state directory {}", path.display())]
    CreateDir {
        path: PathBuf,
        source: io::Error,
    },
}

pub struct Store {
    dir: PathBuf,

    /// Serializes writes per identity.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Store {
    /// Opens the store in `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Reads every entry in the store.
    ///
    /// Files that cannot be read or parsed, and temporary files left behind
    /// by an interrupted write, are logged and skipped.
    pub fn load(&self) -> BTreeMap<String, StoreEntry> {
        let mut entries = BTreeMap::new();

        let dir = match fs::read_dir(&self.dir) {
            Ok(dir) => dir,
            Err(err) => {
                warn!(dir = %self.dir.display(), "could not list the state directory: {err}");
                return entries;
            },
        };

        for file in dir.flatten() {
            let path = file.path();
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };

            if file_name.ends_with(TEMP_SUFFIX) {
                warn!(path = %path.display(), "skipping leftover temporary file");
                continue;
            }

            let Some(identity) = file_name.strip_suffix(&format!(".{ENTRY_EXTENSION}")) else {
                continue;
            };

            match read_entry(&path) {
                Ok(entry) => {
                    entries.insert(identity.to_string(), entry);
                },
                Err(err) => warn!(path = %path.display(), "skipping unreadable entry: {err}"),
            }
        }

        debug!(count = entries.len(), "loaded stored device configurations");
        entries
    }

    /// Durably replaces the entry of `identity`.
    pub async fn save(&self, identity: &str, entry: &StoreEntry) -> Result<(), StoreError> {
        let path = self.entry_path(identity)?;
        let lock = self.identity_lock(identity);
        let _guard = lock.lock().await;

        let data = serde_json::to_vec_pretty(entry).map_err(|source| StoreError::Serialize {
            identity: identity.to_string(),
            source,
        })?;

        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || replace_synced(&dir, &path, &data))
            .await
            .unwrap_or_else(|err| Err(io::Error::other(err)))
            .map_err(|source| StoreError::Write {
                identity: identity.to_string(),
                source,
            })?;

        debug!(identity, "saved device configuration");
        Ok(())
    }

    /// Removes the entry of `identity`. Removing a missing entry succeeds.
    pub async fn delete(&self, identity: &str) -> Result<(), StoreError> {
        let path = self.entry_path(identity)?;
        let lock = self.identity_lock(identity);
        let _guard = lock.lock().await;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Write {
                identity: identity.to_string(),
                source,
            }),
        }
    }

    fn entry_path(&self, identity: &str) -> Result<PathBuf, StoreError> {
        let valid = !identity.is_empty()
            && identity
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidIdentity(identity.to_string()));
        }

        Ok(self.dir.join(format!("{identity}.{ENTRY_EXTENSION}")))
    }

    fn identity_lock(&self, identity: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(identity.to_string()).or_default())
    }
}

fn read_entry(path: &Path) -> Result<StoreEntry, io::Error> {
    let data = fs::read(path)?;
    serde_json::from_slice(&data).map_err(io::Error::other)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

/// Writes `data` to a synced temporary file and renames it over `path`.
fn replace_synced(dir: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    let temp_path = temp_path(path);
    if let Err(err) = write_synced(&temp_path, data).and_then(|()| fs::rename(&temp_path, path)) {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    // Make the rename itself durable.
    if let Ok(dir) = File::open(dir) {
        let _ = dir.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::RatchetMode;

    fn entry(wpid: u16) -> StoreEntry {
        StoreEntry {
            name: "MX Master 3S".to_string(),
            wpid,
            settings: BTreeMap::from([
                (Setting::SmartShiftMode, SettingValue::Mode(RatchetMode::Freespin)),
                (Setting::ScrollInvert, SettingValue::Flag(true)),
            ]),
        }
    }

    #[tokio::test]
    async fn saved_entries_load_again() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        store.save("4A1B2C01", &entry(0xb034)).await.unwrap();
        store.save("71029E02", &StoreEntry::default()).await.unwrap();

        let loaded = store.load();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["4A1B2C01"], entry(0xb034));

        store.delete("71029E02").await.unwrap();
        store.delete("71029E02").await.unwrap();
        assert_eq!(store.load().len(), 1);
    }

    #[tokio::test]
    async fn interrupted_write_keeps_the_previous_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.save("4A1B2C01", &entry(0xb034)).await.unwrap();

        // A crash after writing the temporary file but before the rename.
        fs::write(dir.path().join("4A1B2C01.json.tmp"), b"{\"wpid\": 4").unwrap();

        let loaded = Store::open(dir.path()).unwrap().load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["4A1B2C01"], entry(0xb034));
    }

    #[tokio::test]
    async fn corrupt_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.save("4A1B2C01", &entry(0xb034)).await.unwrap();
        fs::write(dir.path().join("DEADBEEF.json"), b"not json").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let loaded = store.load();
        assert_eq!(loaded.keys().collect::<Vec<_>>(), ["4A1B2C01"]);
    }

    #[tokio::test]
    async fn concurrent_saves_leave_one_complete_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());

        let saves = (0..8u16)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.save("4A1B2C01", &entry(0xb000 + i)).await })
            })
            .collect::<Vec<_>>();
        for save in saves {
            save.await.unwrap().unwrap();
        }

        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        let saved = &loaded["4A1B2C01"];
        assert_eq!(saved, &entry(saved.wpid));
        assert!(!dir.path().join("4A1B2C01.json.tmp").exists());
    }

    #[tokio::test]
    async fn rejects_identities_escaping_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let err = store.save("../evil", &StoreEntry::default()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidIdentity(_)));
    }
}
