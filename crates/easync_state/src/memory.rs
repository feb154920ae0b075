//! In-memory state store for testing.

use crate::collection_state::CollectionState;
use crate::error::{StateError, StateResult};
use crate::record::{CacheField, DirtySet, SyncCacheRecord};
use crate::store::StateStore;
use easync_protocol::{RemoteWipeStatus, SyncKey};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

type UserKey = (String, String);

#[derive(Debug, Default)]
struct Inner {
    caches: BTreeMap<UserKey, SyncCacheRecord>,
    states: HashMap<UserKey, BTreeMap<String, BTreeMap<SyncKey, CollectionState>>>,
    folders: HashMap<UserKey, BTreeMap<String, String>>,
    rw_status: HashMap<String, RemoteWipeStatus>,
    cache_writes: usize,
}

/// An in-memory state store.
///
/// This store keeps everything in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Single-process deployments that accept losing sessions on restart
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use easync_state::{CacheField, DirtySet, InMemoryStateStore, StateStore, SyncCacheRecord};
///
/// let store = InMemoryStateStore::new();
/// let mut record = SyncCacheRecord::default();
/// record.wait = Some(5);
/// let mut dirty = DirtySet::new();
/// dirty.mark_field(CacheField::Wait);
/// store.save_sync_cache(&record, "dev1", "alice", &dirty).unwrap();
///
/// let loaded = store.get_sync_cache("dev1", "alice", None).unwrap();
/// assert_eq!(loaded.wait, Some(5));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    inner: RwLock<Inner>,
}

impl InMemoryStateStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many sync cache saves this store has accepted.
    ///
    /// Useful for asserting that an operation did or did not persist.
    #[must_use]
    pub fn cache_writes(&self) -> usize {
        self.inner.read().cache_writes
    }

    /// Replaces a stored sync cache wholesale, bypassing dirty tracking.
    ///
    /// Useful for simulating a concurrent request in tests.
    pub fn put_sync_cache(&self, device: &str, user: &str, record: SyncCacheRecord) {
        self.inner
            .write()
            .caches
            .insert(key(device, user), record);
    }
}

fn key(device: &str, user: &str) -> UserKey {
    (device.to_string(), user.to_string())
}

impl StateStore for InMemoryStateStore {
    fn get_sync_cache(
        &self,
        device: &str,
        user: &str,
        fields: Option<&[CacheField]>,
    ) -> StateResult<SyncCacheRecord> {
        let inner = self.inner.read();
        let record = inner
            .caches
            .get(&key(device, user))
            .cloned()
            .unwrap_or_default();
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
        let mut inner = self.inner.write();
        inner
            .caches
            .entry(key(device, user))
            .or_default()
            .apply_dirty(record, dirty);
        inner.cache_writes += 1;
        Ok(())
    }

    fn delete_sync_cache(&self, device: &str, user: &str) -> StateResult<()> {
        let mut inner = self.inner.write();
        let k = key(device, user);
        inner.caches.remove(&k);
        inner.states.remove(&k);
        inner.folders.remove(&k);
        Ok(())
    }

    fn list_sync_caches(&self) -> StateResult<Vec<(String, String)>> {
        Ok(self.inner.read().caches.keys().cloned().collect())
    }

    fn read_collection_state(
        &self,
        device: &str,
        user: &str,
        collection: &str,
        synckey: &SyncKey,
    ) -> StateResult<Option<CollectionState>> {
        let inner = self.inner.read();
        Ok(inner
            .states
            .get(&key(device, user))
            .and_then(|collections| collections.get(collection))
            .and_then(|states| states.get(synckey))
            .cloned())
    }

    fn write_collection_state(
        &self,
        device: &str,
        user: &str,
        state: &CollectionState,
    ) -> StateResult<()> {
        if state.synckey.is_zero() {
            return Err(StateError::InvalidKey(state.synckey.to_string()));
        }
        self.inner
            .write()
            .states
            .entry(key(device, user))
            .or_default()
            .entry(state.collection_id.clone())
            .or_default()
            .insert(state.synckey.clone(), state.clone());
        Ok(())
    }

    fn remove_collection_state(
        &self,
        device: &str,
        user: &str,
        collection: &str,
        synckey: Option<&SyncKey>,
    ) -> StateResult<()> {
        let mut inner = self.inner.write();
        if let Some(collections) = inner.states.get_mut(&key(device, user)) {
            match synckey {
                Some(synckey) => {
                    if let Some(states) = collections.get_mut(collection) {
                        states.remove(synckey);
                    }
                }
                None => {
                    collections.remove(collection);
                }
            }
        }
        Ok(())
    }

    fn collection_state_keys(
        &self,
        device: &str,
        user: &str,
        collection: &str,
    ) -> StateResult<Vec<SyncKey>> {
        let inner = self.inner.read();
        Ok(inner
            .states
            .get(&key(device, user))
            .and_then(|collections| collections.get(collection))
            .map(|states| states.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn folder_server_id(
        &self,
        device: &str,
        user: &str,
        uid: &str,
    ) -> StateResult<Option<String>> {
        let inner = self.inner.read();
        Ok(inner
            .folders
            .get(&key(device, user))
            .and_then(|map| map.get(uid))
            .cloned())
    }

    fn folder_uid(&self, device: &str, user: &str, serverid: &str) -> StateResult<Option<String>> {
        let inner = self.inner.read();
        Ok(inner.folders.get(&key(device, user)).and_then(|map| {
            map.iter()
                .find(|(_, sid)| sid.as_str() == serverid)
                .map(|(uid, _)| uid.clone())
        }))
    }

    fn set_folder_mapping(
        &self,
        device: &str,
        user: &str,
        uid: &str,
        serverid: Option<&str>,
    ) -> StateResult<()> {
        let mut inner = self.inner.write();
        let map = inner.folders.entry(key(device, user)).or_default();
        match serverid {
            Some(serverid) => {
                map.insert(uid.to_string(), serverid.to_string());
            }
            None => {
                map.remove(uid);
            }
        }
        Ok(())
    }

    fn device_rw_status(&self, device: &str) -> StateResult<RemoteWipeStatus> {
        Ok(self
            .inner
            .read()
            .rw_status
            .get(device)
            .copied()
            .unwrap_or_default())
    }

    fn set_device_rw_status(&self, device: &str, status: RemoteWipeStatus) -> StateResult<()> {
        self.inner
            .write()
            .rw_status
            .insert(device.to_string(), status);
        Ok(())
    }
}
