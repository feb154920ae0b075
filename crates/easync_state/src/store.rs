//! State store trait definition.

use crate::collection_state::CollectionState;
use crate::error::{StateError, StateResult};
use crate::record::{CacheField, DirtySet, SyncCacheRecord};
use easync_protocol::{RemoteWipeStatus, SyncKey};

/// Durable storage for everything a device session remembers.
///
/// A store holds one [`SyncCacheRecord`] per (device, user), the
/// per-collection [`CollectionState`]s keyed by synckey, the folder UID to
/// backend id mapping and the remote wipe status of each device.
///
/// # Invariants
///
/// - `save_sync_cache` writes only the parts named in the dirty set and
///   leaves every other field and collection of the stored record untouched
/// - a missing sync cache reads as an empty record, never as an error
/// - synckey `"0"` never names a stored collection state
/// - Stores must be `Send + Sync`; concurrent requests share one store
///
/// # Implementors
///
/// - [`super::InMemoryStateStore`] - For testing
/// - [`super::FileStateStore`] - For persistent storage
pub trait StateStore: Send + Sync {
    /// Reads the sync cache of a device and user.
    ///
    /// With `fields` set, only those fields are read; the collections map is
    /// then left empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read.
    fn get_sync_cache(
        &self,
        device: &str,
        user: &str,
        fields: Option<&[CacheField]>,
    ) -> StateResult<SyncCacheRecord>;

    /// Merges the dirty parts of `record` into the stored sync cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    fn save_sync_cache(
        &self,
        record: &SyncCacheRecord,
        device: &str,
        user: &str,
        dirty: &DirtySet,
    ) -> StateResult<()>;

    /// Deletes the sync cache, folder mappings and collection states of a
    /// device and user.
    ///
    /// # Errors
    ///
    /// Returns an error if stored data cannot be removed.
    fn delete_sync_cache(&self, device: &str, user: &str) -> StateResult<()>;

    /// Lists every (device, user) pair with a stored sync cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be enumerated.
    fn list_sync_caches(&self) -> StateResult<Vec<(String, String)>>;

    /// Reads the collection state stored under `synckey`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the state exists but cannot be read.
    fn read_collection_state(
        &self,
        device: &str,
        user: &str,
        collection: &str,
        synckey: &SyncKey,
    ) -> StateResult<Option<CollectionState>>;

    /// Stores a collection state under its own synckey.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written or its synckey is `"0"`.
    fn write_collection_state(
        &self,
        device: &str,
        user: &str,
        state: &CollectionState,
    ) -> StateResult<()>;

    /// Removes collection states.
    ///
    /// With `synckey` set only that state is removed, otherwise all states
    /// of the collection.
    ///
    /// # Errors
    ///
    /// Returns an error if stored data cannot be removed.
    fn remove_collection_state(
        &self,
        device: &str,
        user: &str,
        collection: &str,
        synckey: Option<&SyncKey>,
    ) -> StateResult<()>;

    /// Lists the synckeys stored for a collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be enumerated.
    fn collection_state_keys(
        &self,
        device: &str,
        user: &str,
        collection: &str,
    ) -> StateResult<Vec<SyncKey>>;

    /// Resolves a folder UID to its backend id.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping cannot be read.
    fn folder_server_id(&self, device: &str, user: &str, uid: &str)
        -> StateResult<Option<String>>;

    /// Resolves a backend folder id to its UID.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping cannot be read.
    fn folder_uid(&self, device: &str, user: &str, serverid: &str) -> StateResult<Option<String>>;

    /// Records (or, with `serverid == None`, forgets) a folder mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping cannot be written.
    fn set_folder_mapping(
        &self,
        device: &str,
        user: &str,
        uid: &str,
        serverid: Option<&str>,
    ) -> StateResult<()>;

    /// Returns the remote wipe status of a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device record cannot be read.
    fn device_rw_status(&self, device: &str) -> StateResult<RemoteWipeStatus>;

    /// Sets the remote wipe status of a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device record cannot be written.
    fn set_device_rw_status(&self, device: &str, status: RemoteWipeStatus) -> StateResult<()>;

    /// Loads the state a client refers to with `synckey`.
    ///
    /// `"0"` yields a fresh, empty state. Any other key that was never
    /// stored (or was garbage collected) is [`StateError::StateNotFound`].
    ///
    /// # Errors
    ///
    /// Returns `StateNotFound` for unknown keys, or a store error.
    fn load_collection_state(
        &self,
        device: &str,
        user: &str,
        collection: &str,
        synckey: &SyncKey,
    ) -> StateResult<CollectionState> {
        if synckey.is_zero() {
            return Ok(CollectionState::new(collection, SyncKey::zero()));
        }
        self.read_collection_state(device, user, collection, synckey)?
            .ok_or_else(|| StateError::StateNotFound {
                collection: collection.to_string(),
                synckey: synckey.to_string(),
            })
    }

    /// Stores a state and drops the older states of the same series.
    ///
    /// The state directly preceding the new key is kept: a client that
    /// never received the response carrying the new key retries with it.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    fn save_collection_state(
        &self,
        device: &str,
        user: &str,
        state: &CollectionState,
    ) -> StateResult<()> {
        if state.synckey.is_zero() {
            return Err(StateError::InvalidKey(
                "collection state cannot be stored under synckey 0".to_string(),
            ));
        }
        self.write_collection_state(device, user, state)?;

        for key in self.collection_state_keys(device, user, &state.collection_id)? {
            let obsolete = match key.series() {
                Some(series) if Some(series) == state.synckey.series() => {
                    key.counter() + 1 < state.synckey.counter()
                }
                _ => true,
            };
            if obsolete {
                self.remove_collection_state(device, user, &state.collection_id, Some(&key))?;
            }
        }
        Ok(())
    }
}
