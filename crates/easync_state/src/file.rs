//! File-based state store for persistent sessions.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/
//! └─ <device>/
//!    ├─ device.json                 # Remote wipe status
//!    └─ <user>/
//!       ├─ synccache.json           # SyncCacheRecord
//!       ├─ synccache.lock           # Advisory lock for read-merge-write
//!       ├─ folders.json             # Folder UID -> backend id
//!       └─ state/<collection>/<series>_<counter>.json
//! ```
//!
//! Every file is written to a temporary sibling first and renamed into
//! place, so readers never observe a half-written record.

use crate::collection_state::CollectionState;
use crate::error::{StateError, StateResult};
use crate::record::{CacheField, DirtySet, SyncCacheRecord};
use crate::store::StateStore;
use easync_protocol::{RemoteWipeStatus, SyncKey};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const CACHE_FILE: &str = "synccache.json";
const CACHE_LOCK: &str = "synccache.lock";
const FOLDERS_FILE: &str = "folders.json";
const DEVICE_FILE: &str = "device.json";
const STATE_DIR: &str = "state";

#[derive(Debug, Default, Serialize, Deserialize)]
struct DeviceRecord {
    #[serde(default)]
    rw_status: RemoteWipeStatus,
}

/// A state store backed by a directory of JSON files.
///
/// # Thread Safety
///
/// Sync cache saves take an exclusive `fs2` lock on a per-user lock file
/// for the whole read-merge-write, so concurrent processes sharing the
/// directory cannot lose each other's dirty fields. Other files are
/// replaced atomically by rename.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or `root` is
    /// not a directory.
    pub fn open(root: impl Into<PathBuf>) -> StateResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        if !root.is_dir() {
            return Err(StateError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("not a directory: {}", root.display()),
            )));
        }
        Ok(Self { root })
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rejects keys that would escape the store root.
    fn validate_component(value: &str) -> StateResult<()> {
        if value.is_empty()
            || value.contains('/')
            || value.contains('\\')
            || value.contains("..")
            || value.starts_with('.')
        {
            return Err(StateError::InvalidKey(value.to_string()));
        }
        Ok(())
    }

    fn device_dir(&self, device: &str) -> StateResult<PathBuf> {
        Self::validate_component(device)?;
        Ok(self.root.join(device))
    }

    fn user_dir(&self, device: &str, user: &str) -> StateResult<PathBuf> {
        Self::validate_component(user)?;
        Ok(self.device_dir(device)?.join(user))
    }

    fn collection_dir(&self, device: &str, user: &str, collection: &str) -> StateResult<PathBuf> {
        Self::validate_component(collection)?;
        Ok(self.user_dir(device, user)?.join(STATE_DIR).join(collection))
    }

    fn state_file_name(synckey: &SyncKey) -> StateResult<String> {
        match synckey.series() {
            Some(series) => Ok(format!("{series}_{}.json", synckey.counter())),
            None => Err(StateError::InvalidKey(synckey.to_string())),
        }
    }

    fn parse_state_file_name(name: &str) -> Option<SyncKey> {
        let stem = name.strip_suffix(".json")?;
        let (series, counter) = stem.rsplit_once('_')?;
        SyncKey::parse(&format!("{{{series}}}{counter}")).ok()
    }

    fn lock_file(&self, device: &str, user: &str) -> StateResult<File> {
        let dir = self.user_dir(device, user)?;
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(CACHE_LOCK))?;
        Ok(file)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StateResult<Option<T>> {
    match fs::read(path) {
        Ok(data) if data.is_empty() => Ok(None),
        Ok(data) => serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| StateError::Corrupted(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> StateResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(value)?;
    let temp = path.with_extension("json.tmp");
    let mut file = File::create(&temp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp, path)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> StateResult<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn sub_dirs(path: &Path) -> StateResult<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                dirs.push((name.to_string(), entry.path()));
            }
        }
    }
    dirs.sort();
    Ok(dirs)
}

impl StateStore for FileStateStore {
    fn get_sync_cache(
        &self,
        device: &str,
        user: &str,
        fields: Option<&[CacheField]>,
    ) -> StateResult<SyncCacheRecord> {
        let path = self.user_dir(device, user)?.join(CACHE_FILE);
        let record: SyncCacheRecord = read_json(&path)?.unwrap_or_default();
        Ok(match fields {
            Some(fields) => record.project(fields),
            None => record,
        })
    }

    fn save_sync_cache(
        &self,
        record: &SyncCacheRecord,
        device: &str,
        user: &str,
        dirty: &DirtySet,
    ) -> StateResult<()> {
        let lock = self.lock_file(device, user)?;
        lock.lock_exclusive()?;

        let path = self.user_dir(device, user)?.join(CACHE_FILE);
        let result = read_json::<SyncCacheRecord>(&path).and_then(|stored| {
            let mut merged = stored.unwrap_or_default();
            merged.apply_dirty(record, dirty);
            write_json(&path, &merged)
        });

        lock.unlock()?;
        result
    }

    fn delete_sync_cache(&self, device: &str, user: &str) -> StateResult<()> {
        remove_if_exists(&self.user_dir(device, user)?)
    }

    fn list_sync_caches(&self) -> StateResult<Vec<(String, String)>> {
        let mut caches = Vec::new();
        for (device, device_path) in sub_dirs(&self.root)? {
            for (user, user_path) in sub_dirs(&device_path)? {
                if user_path.join(CACHE_FILE).is_file() {
                    caches.push((device.clone(), user));
                }
            }
        }
        Ok(caches)
    }

    fn read_collection_state(
        &self,
        device: &str,
        user: &str,
        collection: &str,
        synckey: &SyncKey,
    ) -> StateResult<Option<CollectionState>> {
        if synckey.is_zero() {
            return Ok(None);
        }
        let path = self
            .collection_dir(device, user, collection)?
            .join(Self::state_file_name(synckey)?);
        read_json(&path)
    }

    fn write_collection_state(
        &self,
        device: &str,
        user: &str,
        state: &CollectionState,
    ) -> StateResult<()> {
        let path = self
            .collection_dir(device, user, &state.collection_id)?
            .join(Self::state_file_name(&state.synckey)?);
        write_json(&path, state)
    }

    fn remove_collection_state(
        &self,
        device: &str,
        user: &str,
        collection: &str,
        synckey: Option<&SyncKey>,
    ) -> StateResult<()> {
        let dir = self.collection_dir(device, user, collection)?;
        match synckey {
            Some(synckey) => remove_if_exists(&dir.join(Self::state_file_name(synckey)?)),
            None => remove_if_exists(&dir),
        }
    }

    fn collection_state_keys(
        &self,
        device: &str,
        user: &str,
        collection: &str,
    ) -> StateResult<Vec<SyncKey>> {
        let dir = self.collection_dir(device, user, collection)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(key) = entry
                .file_name()
                .to_str()
                .and_then(Self::parse_state_file_name)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn folder_server_id(
        &self,
        device: &str,
        user: &str,
        uid: &str,
    ) -> StateResult<Option<String>> {
        let path = self.user_dir(device, user)?.join(FOLDERS_FILE);
        let map: BTreeMap<String, String> = read_json(&path)?.unwrap_or_default();
        Ok(map.get(uid).cloned())
    }

    fn folder_uid(&self, device: &str, user: &str, serverid: &str) -> StateResult<Option<String>> {
        let path = self.user_dir(device, user)?.join(FOLDERS_FILE);
        let map: BTreeMap<String, String> = read_json(&path)?.unwrap_or_default();
        Ok(map
            .into_iter()
            .find(|(_, sid)| sid == serverid)
            .map(|(uid, _)| uid))
    }

    fn set_folder_mapping(
        &self,
        device: &str,
        user: &str,
        uid: &str,
        serverid: Option<&str>,
    ) -> StateResult<()> {
        let lock = self.lock_file(device, user)?;
        lock.lock_exclusive()?;

        let path = self.user_dir(device, user)?.join(FOLDERS_FILE);
        let result = read_json::<BTreeMap<String, String>>(&path).and_then(|map| {
            let mut map = map.unwrap_or_default();
            match serverid {
                Some(serverid) => {
                    map.insert(uid.to_string(), serverid.to_string());
                }
                None => {
                    map.remove(uid);
                }
            }
            write_json(&path, &map)
        });

        lock.unlock()?;
        result
    }

    fn device_rw_status(&self, device: &str) -> StateResult<RemoteWipeStatus> {
        let path = self.device_dir(device)?.join(DEVICE_FILE);
        let record: DeviceRecord = read_json(&path)?.unwrap_or_default();
        Ok(record.rw_status)
    }

    fn set_device_rw_status(&self, device: &str, status: RemoteWipeStatus) -> StateResult<()> {
        let path = self.device_dir(device)?.join(DEVICE_FILE);
        write_json(&path, &DeviceRecord { rw_status: status })
    }
}
