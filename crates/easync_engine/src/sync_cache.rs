//! The per-device sync cache and its dirty tracking.

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::session::SessionContext;
use easync_protocol::{
    class_for_folder_type, normalize_window_size, Collection, CollectionClass, FolderEntry,
    SyncKey,
};
use easync_state::{CacheField, CachedFolder, DirtySet, StateStore, SyncCacheRecord};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Options for [`SyncCache::update_collection`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Store the collection's `newsynckey` as its synckey.
    pub new_synckey: bool,
    /// Clear the collection's `getchanges` flag.
    pub unset_changes: bool,
}

/// A device's durable session record, loaded for one request.
///
/// Every mutator marks the field or collection it touched, and
/// [`SyncCache::save`] writes only those parts, so requests racing on the
/// same device do not overwrite each other's unrelated updates.
///
/// # Invariants
///
/// - after `save`, no cached collection carries a `synckey`; the key is
///   durable only as `lastsynckey`
/// - `validate` compares against the store, never against memory
pub struct SyncCache {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    device: String,
    user: String,
    data: SyncCacheRecord,
    dirty: DirtySet,
}

impl SyncCache {
    /// Loads the sync cache of the context's device and user.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    pub fn new(ctx: &SessionContext) -> EngineResult<Self> {
        let mut cache = Self {
            store: Arc::clone(&ctx.store),
            clock: Arc::clone(&ctx.clock),
            device: ctx.device.id.clone(),
            user: ctx.device.user.clone(),
            data: SyncCacheRecord::default(),
            dirty: DirtySet::new(),
        };
        cache.load()?;
        Ok(cache)
    }

    /// Reloads the whole record from the store and forgets all dirt.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    pub fn load(&mut self) -> EngineResult<()> {
        self.data = self.store.get_sync_cache(&self.device, &self.user, None)?;
        self.dirty.clear();
        Ok(())
    }

    /// Returns true if no other process advanced the session clocks since
    /// this copy was loaded or last saved.
    ///
    /// With `hb_only` only the heartbeat start is compared; a looping sync
    /// uses this because its own saves advance `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored clocks cannot be read.
    pub fn validate(&self, hb_only: bool) -> EngineResult<bool> {
        let fields: &[CacheField] = if hb_only {
            &[CacheField::Lasthbsyncstarted]
        } else {
            &[CacheField::Timestamp, CacheField::Lasthbsyncstarted]
        };
        let stored = self
            .store
            .get_sync_cache(&self.device, &self.user, Some(fields))?;

        if stored.lasthbsyncstarted != self.data.lasthbsyncstarted {
            debug!(
                device = %self.device,
                stored = ?stored.lasthbsyncstarted,
                ours = ?self.data.lasthbsyncstarted,
                "heartbeat start changed by another request"
            );
            return Ok(false);
        }
        if !hb_only && stored.timestamp != self.data.timestamp {
            debug!(
                device = %self.device,
                stored = stored.timestamp,
                ours = self.data.timestamp,
                "sync cache timestamp changed by another request"
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Returns false if the last looping sync did not end normally or its
    /// planned end is still in the future.
    pub fn validate_timestamps(&self) -> bool {
        if let Some(started) = self.data.lasthbsyncstarted {
            match self.data.lastsyncendnormal {
                None => return false,
                Some(ended) if started > ended => return false,
                Some(_) => {}
            }
        }
        if let Some(until) = self.data.lastuntil {
            if self.clock.now() < until {
                return false;
            }
        }
        true
    }

    /// Checkpoints live synckeys and writes the dirty parts of the record.
    ///
    /// Every collection holding a `synckey` has it rotated into
    /// `lastsynckey`. `timestamp` is set to now.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn save(&mut self) -> EngineResult<()> {
        for collection in self.data.collections.values_mut() {
            if let Some(synckey) = collection.synckey.take() {
                collection.lastsynckey = Some(synckey);
            }
        }
        self.data.timestamp = self.clock.now();
        self.dirty.mark_field(CacheField::Timestamp);

        self.store
            .save_sync_cache(&self.data, &self.device, &self.user, &self.dirty)?;
        debug!(device = %self.device, user = %self.user, "saved sync cache");
        self.dirty.clear();
        Ok(())
    }

    /// Deletes the record from the store and resets this copy.
    ///
    /// # Errors
    ///
    /// Returns an error if stored data cannot be removed.
    pub fn delete(&mut self) -> EngineResult<()> {
        self.store.delete_sync_cache(&self.device, &self.user)?;
        self.data = SyncCacheRecord::default();
        self.dirty.clear();
        Ok(())
    }

    /// Returns the in-memory record.
    pub fn record(&self) -> &SyncCacheRecord {
        &self.data
    }

    /// Returns the pending dirt.
    pub fn dirty(&self) -> &DirtySet {
        &self.dirty
    }

    /// Heartbeat interval in seconds.
    pub fn hbinterval(&self) -> Option<u64> {
        self.data.hbinterval
    }

    /// Sets the heartbeat interval.
    pub fn set_hbinterval(&mut self, value: Option<u64>) {
        self.data.hbinterval = value;
        self.dirty.mark_field(CacheField::Hbinterval);
    }

    /// Wait interval in minutes.
    pub fn wait(&self) -> Option<u64> {
        self.data.wait
    }

    /// Sets the wait interval.
    pub fn set_wait(&mut self, value: Option<u64>) {
        self.data.wait = value;
        self.dirty.mark_field(CacheField::Wait);
    }

    /// Heartbeat of the last PING.
    pub fn pingheartbeat(&self) -> Option<u64> {
        self.data.pingheartbeat
    }

    /// Sets the PING heartbeat.
    pub fn set_pingheartbeat(&mut self, value: Option<u64>) {
        self.data.pingheartbeat = value;
        self.dirty.mark_field(CacheField::Pingheartbeat);
    }

    /// Planned end of the last looping sync.
    pub fn lastuntil(&self) -> Option<i64> {
        self.data.lastuntil
    }

    /// Sets the planned end of the current looping sync.
    pub fn set_lastuntil(&mut self, value: Option<i64>) {
        self.data.lastuntil = value;
        self.dirty.mark_field(CacheField::Lastuntil);
    }

    /// Start of the last looping sync.
    pub fn lasthbsyncstarted(&self) -> Option<i64> {
        self.data.lasthbsyncstarted
    }

    /// Sets the start of the current looping sync.
    pub fn set_lasthbsyncstarted(&mut self, value: Option<i64>) {
        self.data.lasthbsyncstarted = value;
        self.dirty.mark_field(CacheField::Lasthbsyncstarted);
    }

    /// End of the last looping sync that ended normally.
    pub fn lastsyncendnormal(&self) -> Option<i64> {
        self.data.lastsyncendnormal
    }

    /// Records a normal end of a looping sync.
    pub fn set_lastsyncendnormal(&mut self, value: Option<i64>) {
        self.data.lastsyncendnormal = value;
        self.dirty.mark_field(CacheField::Lastsyncendnormal);
    }

    /// Time of the last save.
    pub fn timestamp(&self) -> i64 {
        self.data.timestamp
    }

    /// Hierarchy synckey.
    pub fn hierarchy(&self) -> Option<&SyncKey> {
        self.data.hierarchy.as_ref()
    }

    /// Sets the hierarchy synckey.
    pub fn set_hierarchy(&mut self, synckey: Option<SyncKey>) {
        self.data.hierarchy = synckey;
        self.dirty.mark_field(CacheField::Hierarchy);
    }

    /// Synckeys issued and not yet confirmed by the client.
    pub fn confirmed_synckeys(&self) -> &BTreeSet<SyncKey> {
        &self.data.confirmed_synckeys
    }

    /// Returns true if `synckey` awaits confirmation.
    pub fn has_confirmed_key(&self, synckey: &SyncKey) -> bool {
        self.data.confirmed_synckeys.contains(synckey)
    }

    /// Adds an issued synckey awaiting confirmation.
    pub fn add_confirmed_key(&mut self, synckey: SyncKey) {
        self.data.confirmed_synckeys.insert(synckey);
        self.dirty.mark_field(CacheField::ConfirmedSynckeys);
    }

    /// Removes a confirmed synckey.
    pub fn remove_confirmed_key(&mut self, synckey: &SyncKey) {
        if self.data.confirmed_synckeys.remove(synckey) {
            self.dirty.mark_field(CacheField::ConfirmedSynckeys);
        }
    }

    /// Forgets every pending synckey.
    pub fn clear_confirmed_keys(&mut self) {
        self.data.confirmed_synckeys.clear();
        self.dirty.mark_field(CacheField::ConfirmedSynckeys);
    }

    /// Replay counters per collection and synckey.
    pub fn synckeycounter(&self) -> &BTreeMap<String, BTreeMap<String, u32>> {
        &self.data.synckeycounter
    }

    /// Replaces the replay counters.
    pub fn set_synckeycounter(&mut self, counters: BTreeMap<String, BTreeMap<String, u32>>) {
        self.data.synckeycounter = counters;
        self.dirty.mark_field(CacheField::Synckeycounter);
    }

    /// Returns cached collections with their ids filled in.
    ///
    /// A collection without a live `synckey` takes its `lastsynckey`. With
    /// `require_key`, collections with neither are left out.
    pub fn collections(&self, require_key: bool) -> Vec<Collection> {
        self.data
            .collections
            .iter()
            .filter_map(|(id, cached)| {
                let mut collection = cached.clone();
                collection.id = id.clone();
                if collection.synckey.is_none() {
                    collection.synckey = collection.lastsynckey.clone();
                }
                if require_key && collection.synckey.is_none() {
                    return None;
                }
                Some(collection)
            })
            .collect()
    }

    /// Returns one cached collection as stored.
    pub fn collection(&self, id: &str) -> Option<&Collection> {
        self.data.collections.get(id)
    }

    /// Returns the number of cached collections.
    pub fn count_collections(&self) -> usize {
        self.data.collections.len()
    }

    /// Returns true if the collection is cached.
    pub fn collection_exists(&self, id: &str) -> bool {
        self.data.collections.contains_key(id)
    }

    /// Caches the negotiated options of a new collection.
    ///
    /// Synckeys and per-request flags are not copied.
    pub fn add_collection(&mut self, collection: &Collection) {
        let cached = Collection {
            id: collection.id.clone(),
            serverid: collection.serverid.clone(),
            class: collection.class,
            windowsize: collection.windowsize,
            deletesasmoves: collection.deletesasmoves,
            filtertype: collection.filtertype,
            truncation: collection.truncation,
            rtftruncation: collection.rtftruncation,
            mimesupport: collection.mimesupport,
            mimetruncation: collection.mimetruncation,
            conflict: collection.conflict,
            bodyprefs: collection.bodyprefs.clone(),
            ..Collection::default()
        };
        self.data.collections.insert(collection.id.clone(), cached);
        self.dirty.mark_collection(&collection.id);
    }

    /// Forces a collection to resynchronize, or forgets it entirely.
    ///
    /// Without `purge` the entry stays and its synckey becomes `"0"`. With
    /// `purge` (the folder is gone) the entry is deleted.
    pub fn remove_collection(&mut self, id: &str, purge: bool) {
        if purge {
            self.data.collections.remove(id);
            self.dirty.mark_removed(id);
            return;
        }
        if let Some(collection) = self.data.collections.get_mut(id) {
            collection.synckey = Some(SyncKey::zero());
            self.dirty.mark_collection(id);
        }
    }

    /// Merges the set fields of `collection` into its cached entry.
    pub fn update_collection(&mut self, collection: &Collection, options: UpdateOptions) {
        if collection.id.is_empty() {
            warn!(device = %self.device, "collection without id, not cached");
            return;
        }
        let cached = self
            .data
            .collections
            .entry(collection.id.clone())
            .or_insert_with(|| Collection::new(collection.id.clone()));

        if options.new_synckey {
            if let Some(newsynckey) = &collection.newsynckey {
                cached.synckey = Some(newsynckey.clone());
            }
        } else if let Some(synckey) = &collection.synckey {
            cached.synckey = Some(synckey.clone());
        }
        if collection.serverid.is_some() {
            cached.serverid = collection.serverid.clone();
        }
        if collection.class.is_some() {
            cached.class = collection.class;
        }
        if collection.windowsize.is_some() {
            cached.windowsize = collection.windowsize;
        }
        if collection.deletesasmoves.is_some() {
            cached.deletesasmoves = collection.deletesasmoves;
        }
        if collection.filtertype.is_some() {
            cached.filtertype = collection.filtertype;
        }
        if collection.truncation.is_some() {
            cached.truncation = collection.truncation;
        }
        if collection.rtftruncation.is_some() {
            cached.rtftruncation = collection.rtftruncation;
        }
        if collection.mimesupport.is_some() {
            cached.mimesupport = collection.mimesupport;
        }
        if collection.mimetruncation.is_some() {
            cached.mimetruncation = collection.mimetruncation;
        }
        if collection.conflict.is_some() {
            cached.conflict = collection.conflict;
        }
        if collection.bodyprefs.is_some() {
            cached.bodyprefs = collection.bodyprefs.clone();
        }
        if options.unset_changes {
            cached.getchanges = false;
        }
        self.dirty.mark_collection(&collection.id);
    }

    /// Sets the window size of a cached collection.
    pub fn update_window_size(&mut self, id: &str, windowsize: u32) {
        if let Some(collection) = self.data.collections.get_mut(id) {
            collection.windowsize = Some(windowsize);
            self.dirty.mark_collection(id);
        }
    }

    /// Drops the live synckey of every cached collection.
    pub fn clear_collection_keys(&mut self) {
        let ids: Vec<String> = self.data.collections.keys().cloned().collect();
        for id in ids {
            if let Some(collection) = self.data.collections.get_mut(&id) {
                collection.synckey = None;
            }
            self.dirty.mark_collection(&id);
        }
    }

    /// Forgets every cached collection.
    pub fn clear_collections(&mut self) {
        let ids: Vec<String> = self.data.collections.keys().cloned().collect();
        for id in &ids {
            self.dirty.mark_removed(id);
        }
        self.data.collections.clear();
    }

    fn cached_mut(&mut self, id: &str) -> EngineResult<&mut Collection> {
        self.data
            .collections
            .get_mut(id)
            .ok_or_else(|| EngineError::MissingCollection(id.to_string()))
    }

    /// Marks a cached collection as eligible for PING.
    ///
    /// # Errors
    ///
    /// Returns `MissingCollection` if the collection is not cached.
    pub fn set_pingable(&mut self, id: &str) -> EngineResult<()> {
        self.cached_mut(id)?.pingable = true;
        self.dirty.mark_collection(id);
        Ok(())
    }

    /// Removes PING eligibility from a cached collection.
    ///
    /// # Errors
    ///
    /// Returns `MissingCollection` if the collection is not cached.
    pub fn remove_pingable(&mut self, id: &str) -> EngineResult<()> {
        self.cached_mut(id)?.pingable = false;
        self.dirty.mark_collection(id);
        Ok(())
    }

    /// Returns true if the collection is cached and eligible for PING.
    pub fn is_pingable(&self, id: &str) -> bool {
        self.data
            .collections
            .get(id)
            .map_or(false, |c| c.pingable)
    }

    /// Records that a PING saw changes in a collection.
    ///
    /// # Errors
    ///
    /// Returns `MissingCollection` if the collection is not cached.
    pub fn set_ping_change(&mut self, id: &str) -> EngineResult<()> {
        self.cached_mut(id)?.pingchange = true;
        self.dirty.mark_collection(id);
        Ok(())
    }

    /// Clears the PING change flag of a collection.
    ///
    /// # Errors
    ///
    /// Returns `MissingCollection` if the collection is not cached.
    pub fn reset_ping_change(&mut self, id: &str) -> EngineResult<()> {
        self.cached_mut(id)?.pingchange = false;
        self.dirty.mark_collection(id);
        Ok(())
    }

    /// Returns true if a PING saw changes not yet picked up.
    pub fn has_ping_change(&self, id: &str) -> bool {
        self.data
            .collections
            .get(id)
            .map_or(false, |c| c.pingchange)
    }

    /// Replaces the cached collections with the stored ones that have a
    /// durable key, taking `lastsynckey` as the live key.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    pub fn refresh_collections(&mut self) -> EngineResult<()> {
        let stored = self.store.get_sync_cache(&self.device, &self.user, None)?;
        self.data.collections = stored
            .collections
            .into_iter()
            .filter_map(|(id, mut collection)| {
                let lastsynckey = collection.lastsynckey.clone()?;
                collection.id = id.clone();
                collection.synckey = Some(lastsynckey);
                Some((id, collection))
            })
            .collect();
        self.dirty.clear_collections();
        Ok(())
    }

    /// Fills options the client omitted from what the cache remembers.
    ///
    /// Class comes from the folder cache; filter type, MIME support, body
    /// preferences and window size from the cached collection. Window sizes
    /// of `0` or above the maximum become the maximum. A client restarting
    /// a collection with `"0"` drops the cached live key.
    pub fn validate_collections_from_cache(
        &mut self,
        collections: &mut BTreeMap<String, Collection>,
        default_window_size: u32,
    ) {
        for collection in collections.values_mut() {
            let id = collection.id.clone();
            if collection.class.is_none() {
                collection.class = self.data.folders.get(&id).map(|f| f.class);
            }
            let cached = self.data.collections.get(&id);
            if collection.filtertype.is_none() {
                collection.filtertype = cached.and_then(|c| c.filtertype);
            }
            if collection.mimesupport.is_none() {
                collection.mimesupport = cached.and_then(|c| c.mimesupport);
            }
            if collection.bodyprefs.is_none() {
                collection.bodyprefs = cached.and_then(|c| c.bodyprefs.clone());
            }
            let windowsize = collection
                .windowsize
                .or_else(|| cached.and_then(|c| c.windowsize))
                .unwrap_or(default_window_size);
            collection.windowsize = Some(normalize_window_size(windowsize));

            let restarting = collection.synckey.as_ref().map_or(false, SyncKey::is_zero);
            let cached_live = cached
                .and_then(|c| c.synckey.as_ref())
                .map_or(false, |k| !k.is_zero());
            if restarting && cached_live {
                if let Some(c) = self.data.collections.get_mut(&id) {
                    c.synckey = None;
                    self.dirty.mark_collection(&id);
                }
            }
        }
    }

    /// Returns the folder cache keyed by folder UID.
    pub fn folders(&self) -> &BTreeMap<String, CachedFolder> {
        &self.data.folders
    }

    /// Returns one cached folder.
    pub fn folder(&self, uid: &str) -> Option<&CachedFolder> {
        self.data.folders.get(uid)
    }

    /// Returns the class of a cached folder.
    pub fn folder_class(&self, uid: &str) -> Option<CollectionClass> {
        self.data.folders.get(uid).map(|f| f.class)
    }

    /// Caches a folder reported by a hierarchy sync under `uid`.
    pub fn update_folder(&mut self, uid: &str, folder: &FolderEntry) {
        self.data.folders.insert(
            uid.to_string(),
            CachedFolder {
                class: class_for_folder_type(folder.folder_type),
                serverid: folder.serverid.clone(),
                parentid: Some(folder.parentid.clone()),
                displayname: Some(folder.displayname.clone()),
                folder_type: Some(folder.folder_type),
                filtertype: Some(0),
            },
        );
        self.dirty.mark_field(CacheField::Folders);
    }

    /// Forgets a folder and its collection.
    pub fn delete_folder(&mut self, uid: &str) {
        self.data.folders.remove(uid);
        self.dirty.mark_field(CacheField::Folders);
        if self.data.collections.remove(uid).is_some() {
            self.dirty.mark_removed(uid);
        }
    }

    /// Forgets every folder.
    pub fn clear_folders(&mut self) {
        self.data.folders.clear();
        self.dirty.mark_field(CacheField::Folders);
    }
}

impl std::fmt::Debug for SyncCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCache")
            .field("device", &self.device)
            .field("user", &self.user)
            .field("data", &self.data)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}
