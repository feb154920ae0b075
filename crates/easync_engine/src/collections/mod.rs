//! The working set of collections for one request.
//!
//! [`Collections`] reconciles what the client sent with what the
//! [`SyncCache`] remembers, and runs the long poll of PING and looping
//! SYNC requests (see [`Collections::poll_for_changes`]).

mod partial;
mod poll;

pub use partial::{collection_digest, normalized_snapshot};
pub use poll::PollOptions;

use crate::error::{BackendError, EngineError, EngineResult};
use crate::hierarchy::HierarchyCache;
use crate::session::{SessionContext, VERSION_TWELVE_ONE};
use crate::sync_cache::{SyncCache, UpdateOptions};
use easync_protocol::{ChangeRecord, Collection, CollectionClass, SyncKey};
use easync_state::{CollectionState, StateStore};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, warn};

/// The collections a request works on, backed by the device's sync cache.
pub struct Collections {
    ctx: SessionContext,
    cache: SyncCache,
    collections: BTreeMap<String, Collection>,
    remaining: BTreeMap<String, Collection>,
    unchanged_count: usize,
    synckey_count: usize,
    confirmed_count: usize,
    window_size: Option<u32>,
    imported_changes: bool,
    short_sync_request: bool,
    hanging_sync: bool,
    changes: HashMap<String, Vec<ChangeRecord>>,
}

impl Collections {
    /// Loads the sync cache and starts with an empty working set.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync cache cannot be read.
    pub fn new(ctx: SessionContext) -> EngineResult<Self> {
        let cache = SyncCache::new(&ctx)?;
        Ok(Self {
            ctx,
            cache,
            collections: BTreeMap::new(),
            remaining: BTreeMap::new(),
            unchanged_count: 0,
            synckey_count: 0,
            confirmed_count: 0,
            window_size: None,
            imported_changes: false,
            short_sync_request: false,
            hanging_sync: false,
            changes: HashMap::new(),
        })
    }

    /// Returns the session context.
    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Returns the sync cache.
    pub fn cache(&self) -> &SyncCache {
        &self.cache
    }

    /// Returns the sync cache for modification.
    pub fn cache_mut(&mut self) -> &mut SyncCache {
        &mut self.cache
    }

    /// Returns the working set.
    pub fn collections(&self) -> &BTreeMap<String, Collection> {
        &self.collections
    }

    /// Returns one collection of the working set.
    pub fn collection(&self, id: &str) -> Option<&Collection> {
        self.collections.get(id)
    }

    /// Returns one collection of the working set for modification.
    pub fn collection_mut(&mut self, id: &str) -> Option<&mut Collection> {
        self.collections.get_mut(id)
    }

    /// Returns the ids of the working set, in order.
    pub fn ids(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    /// Iterates over the working set.
    pub fn iter(&self) -> impl Iterator<Item = &Collection> {
        self.collections.values()
    }

    /// Fills the working set with every cached collection.
    ///
    /// Older clients omit `serverid` and `class`; both are back-filled from
    /// the folder mapping and the folder cache. A collection whose folder
    /// no longer resolves is skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder mapping cannot be read.
    pub fn load_collections_from_cache(&mut self) -> EngineResult<()> {
        for mut collection in self.cache.collections(false) {
            debug!(collection = %collection.id, "loading collection from cache");
            if collection.serverid.is_none() {
                collection.serverid = self.lookup_server_id(&collection.id)?;
            }
            let Some(serverid) = collection.serverid.clone() else {
                warn!(collection = %collection.id, "no backend folder for cached collection, skipping");
                continue;
            };
            match self.ctx.backend.folder(&serverid) {
                Ok(folder) => {
                    if collection.class.is_none() {
                        collection.class = Some(folder.class());
                    }
                }
                Err(BackendError::FolderGone(_)) => {
                    warn!(collection = %collection.id, %serverid, "backend folder gone, skipping");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
            if collection.class.is_none() {
                collection.class = self.cache.folder_class(&collection.id);
            }
            self.collections.insert(collection.id.clone(), collection);
        }
        Ok(())
    }

    /// Returns a collection populated with request defaults.
    pub fn get_new_collection(&self, id: impl Into<String>) -> Collection {
        Collection::with_defaults(id)
    }

    /// Adds a client-supplied collection to the working set.
    ///
    /// With `require_synckey`, a collection sent without a key takes the
    /// cached `lastsynckey`.
    ///
    /// # Errors
    ///
    /// Returns `StateGone` if a key is required and the cache has none; the
    /// client is using a collection it never synchronized.
    pub fn add_collection(
        &mut self,
        mut collection: Collection,
        require_synckey: bool,
    ) -> EngineResult<()> {
        if require_synckey && collection.synckey.is_none() {
            let cached = self.cache.collection(&collection.id).and_then(|c| {
                c.lastsynckey.clone().or_else(|| c.synckey.clone())
            });
            match cached {
                Some(synckey) => collection.synckey = Some(synckey),
                None => {
                    warn!(collection = %collection.id, "collection used before its first sync");
                    return Err(EngineError::StateGone {
                        collection: collection.id,
                    });
                }
            }
        }
        if collection.importedchanges {
            self.imported_changes = true;
        }
        self.collections.insert(collection.id.clone(), collection);
        Ok(())
    }

    /// Returns the size of the working set.
    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    /// Returns the number of cached collections.
    pub fn cached_collection_count(&self) -> usize {
        self.cache.count_collections()
    }

    /// Marks a collection for a change export this round.
    ///
    /// # Errors
    ///
    /// Returns `MissingCollection` if the collection is not in the working set.
    pub fn set_get_changes_flag(&mut self, id: &str) -> EngineResult<()> {
        self.collections
            .get_mut(id)
            .map(|c| c.getchanges = true)
            .ok_or_else(|| EngineError::MissingCollection(id.to_string()))
    }

    /// Returns the getchanges flag of a collection.
    ///
    /// # Errors
    ///
    /// Returns `MissingCollection` if the collection is not in the working set.
    pub fn get_changes_flag(&self, id: &str) -> EngineResult<bool> {
        self.collections
            .get(id)
            .map(|c| c.getchanges)
            .ok_or_else(|| EngineError::MissingCollection(id.to_string()))
    }

    /// Sets the request-wide window size.
    pub fn set_default_window_size(&mut self, window_size: u32) {
        self.window_size = Some(window_size);
    }

    /// Returns the request-wide window size, if the client sent one.
    pub fn default_window_size(&self) -> Option<u32> {
        self.window_size
    }

    /// Records that the client sent changes in this request.
    pub fn set_imported_changes(&mut self) {
        self.imported_changes = true;
    }

    /// Returns true if the client sent changes in this request.
    pub fn imported_changes(&self) -> bool {
        self.imported_changes
    }

    /// Records that the request carried no collections.
    pub fn set_short_sync_request(&mut self, short: bool) {
        self.short_sync_request = short;
    }

    /// Returns true if the request carried no collections.
    pub fn short_sync_request(&self) -> bool {
        self.short_sync_request
    }

    /// Records that this request is a looping sync.
    pub fn set_hanging_sync(&mut self, hanging: bool) {
        self.hanging_sync = hanging;
    }

    /// Returns true if this request is a looping sync.
    pub fn hanging_sync(&self) -> bool {
        self.hanging_sync
    }

    /// Fills options the client omitted from the cache.
    pub fn validate_from_cache(&mut self) {
        let default_window = self
            .window_size
            .unwrap_or(self.ctx.config.default_window_size);
        self.cache
            .validate_collections_from_cache(&mut self.collections, default_window);
    }

    /// Re-reads every collection of the working set from the store, so a
    /// long poll works on the latest synckeys. Collections that lost their
    /// durable key leave the working set.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be read.
    pub fn update_collections_from_cache(&mut self) -> EngineResult<()> {
        self.cache.refresh_collections()?;
        let refreshed: BTreeMap<String, Collection> = self
            .cache
            .collections(true)
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        let ids = self.ids();
        for id in ids {
            match refreshed.get(&id) {
                Some(collection) => {
                    debug!(collection = %id, "refreshing collection from cache");
                    let mut collection = collection.clone();
                    if let Some(current) = self.collections.get(&id) {
                        if collection.serverid.is_none() {
                            collection.serverid = current.serverid.clone();
                        }
                        if collection.class.is_none() {
                            collection.class = current.class;
                        }
                    }
                    self.collections.insert(id, collection);
                }
                None => {
                    self.collections.remove(&id);
                }
            }
        }
        Ok(())
    }

    /// Returns the class of a collection as known to the folder cache.
    pub fn collection_class(&self, id: &str) -> Option<CollectionClass> {
        self.cache.folder_class(id)
    }

    /// Returns true if there is anything to synchronize.
    ///
    /// From protocol 12.1 on, an empty request means "the same as last
    /// time", so the cached collections with a synckey are taken over.
    pub fn have_syncable_collections(&mut self, version: u16) -> bool {
        if !self.collections.is_empty() {
            debug!("have syncable collections");
            return true;
        }
        if version < VERSION_TWELVE_ONE {
            return false;
        }
        debug!("no collections in request, looking in the sync cache");
        let mut found = false;
        for collection in self.cache.collections(true) {
            debug!(collection = %collection.id, "found a syncable collection in the cache");
            self.collections.insert(collection.id.clone(), collection);
            found = true;
        }
        found
    }

    /// Stores the looping sync intervals of the request. Absent values keep
    /// what the cache remembers.
    pub fn set_heartbeat(&mut self, wait: Option<u64>, hbinterval: Option<u64>) {
        if wait.is_some() {
            self.cache.set_wait(wait);
        }
        if hbinterval.is_some() {
            self.cache.set_hbinterval(hbinterval);
        }
    }

    /// Returns the heartbeat in seconds: `hbinterval`, else `wait` minutes.
    pub fn heartbeat(&self) -> Option<u64> {
        match (self.cache.hbinterval(), self.cache.wait()) {
            (Some(hb), _) if hb > 0 => Some(hb),
            (_, Some(wait)) if wait > 0 => Some(wait * 60),
            _ => None,
        }
    }

    /// Returns true if this request should hold the connection open.
    pub fn can_do_looping_sync(&self) -> bool {
        (self.short_sync_request || self.cache.hbinterval().is_some() || self.cache.wait().is_some())
            && !self.imported_changes
    }

    /// Returns true if another request started a newer looping sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored clocks cannot be read.
    pub fn check_stale_request(&self) -> EngineResult<bool> {
        Ok(!self.cache.validate(true)?)
    }

    /// Returns true if the device holds a folder hierarchy.
    pub fn have_hierarchy(&self) -> bool {
        self.cache.hierarchy().is_some()
    }

    /// Prepares the cache for a full SYNC: every pending confirmation and
    /// live key is forgotten.
    pub fn init_full_sync(&mut self) {
        self.cache.clear_confirmed_keys();
        self.cache.clear_collection_keys();
    }

    /// Returns true if an empty response is acceptable.
    pub fn can_send_empty_response(&self) -> bool {
        !self.imported_changes && (self.cache.wait().is_some() || self.cache.hbinterval().is_some())
    }

    /// Returns true if a partial SYNC changed nothing and has no interval,
    /// so there is nothing to wait for.
    pub fn have_no_changes_in_partial_sync(&self) -> bool {
        self.synckey_count > 0
            && self.confirmed_count == 0
            && self.unchanged_count == self.synckey_count
            && self.cache.wait().is_none()
            && self.cache.hbinterval().is_none()
    }

    /// Adds the cached collections a partial SYNC did not mention.
    pub fn get_missing_collections_from_cache(&mut self) {
        let remaining = std::mem::take(&mut self.remaining);
        for (id, mut collection) in remaining {
            if let Some(window) = self.window_size {
                collection.windowsize = Some(window);
            }
            debug!(collection = %id, "using cached state for collection");
            self.collections.insert(id, collection);
        }
    }

    /// Checks the synckey replay counters.
    ///
    /// A collection whose key was replayed more than the configured maximum
    /// is stuck in a sync loop; its stored states are dropped and `false`
    /// is returned. Keys seen for the first time reset their collection's
    /// counters.
    ///
    /// # Errors
    ///
    /// Returns an error if stored states cannot be removed.
    pub fn check_loop_counters(&mut self) -> EngineResult<bool> {
        let max = self.ctx.config.max_synckey_count;
        let mut counters = self.cache.synckeycounter().clone();
        for (id, collection) in &self.collections {
            let Some(synckey) = collection.synckey.as_ref().map(SyncKey::to_string) else {
                continue;
            };
            let count = counters
                .get(id)
                .and_then(|keys| keys.get(&synckey))
                .copied()
                .unwrap_or(0);
            if count > max {
                error!(collection = %id, %synckey, count, "synckey replayed too often, clearing state");
                self.ctx.store.remove_collection_state(
                    &self.ctx.device.id,
                    &self.ctx.device.user,
                    id,
                    None,
                )?;
                return Ok(false);
            }
            if count == 0 {
                counters.insert(id.clone(), BTreeMap::from([(synckey, 0)]));
            } else {
                debug!(collection = %id, %synckey, count, "loop counter");
            }
        }
        self.cache.set_synckeycounter(counters);
        Ok(true)
    }

    /// Counts one more use of `synckey` by a collection.
    pub fn increment_loop_counter(&mut self, id: &str, synckey: &SyncKey) {
        let mut counters = self.cache.synckeycounter().clone();
        let count = counters
            .entry(id.to_string())
            .or_default()
            .entry(synckey.to_string())
            .or_insert(0);
        *count += 1;
        if *count > 1 {
            debug!(collection = %id, %synckey, "synckey seen before");
        }
        self.cache.set_synckeycounter(counters);
    }

    /// Returns false if a collection changed its filter type, after
    /// resetting its cached key.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be saved.
    pub fn check_filter_type(&mut self) -> EngineResult<bool> {
        let changed = self.collections.iter().find_map(|(id, collection)| {
            let cached = self.cache.collection(id)?.filtertype?;
            let requested = collection.filtertype?;
            (cached != 0 && requested != 0 && cached != requested).then(|| id.clone())
        });
        match changed {
            Some(id) => {
                debug!(collection = %id, "filter type changed, invalidating synckey");
                self.cache.remove_collection(&id, false);
                self.cache.save()?;
                Ok(false)
            }
            None => Ok(true),
        }
    }

    /// Writes the working set into the cache.
    pub fn update_cache(&mut self) {
        for collection in self.collections.values() {
            self.cache.update_collection(collection, UpdateOptions::default());
        }
    }

    /// Saves the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be written.
    pub fn save(&mut self) -> EngineResult<()> {
        self.cache.save()
    }

    /// Loads the stored state a collection's synckey refers to.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the collection has no synckey yet and
    /// `StateGone` if its synckey names no stored state.
    pub fn init_collection_state(&self, collection: &Collection) -> EngineResult<CollectionState> {
        let synckey = collection.synckey.as_ref().ok_or_else(|| {
            EngineError::invalid_request(format!("collection {} has no synckey", collection.id))
        })?;
        debug!(collection = %collection.id, %synckey, "initializing collection state");
        let mut state = self.ctx.store.load_collection_state(
            &self.ctx.device.id,
            &self.ctx.device.user,
            &collection.id,
            synckey,
        )?;
        if state.class.is_none() {
            state.class = collection.class;
        }
        Ok(state)
    }

    /// Resolves the backend folder of a collection.
    ///
    /// # Errors
    ///
    /// Returns `FolderGone` if neither the collection, the folder mapping
    /// nor the folder cache knows it.
    pub fn server_id(&self, collection: &Collection) -> EngineResult<String> {
        if let Some(serverid) = &collection.serverid {
            return Ok(serverid.clone());
        }
        self.lookup_server_id(&collection.id)?
            .ok_or_else(|| EngineError::FolderGone(collection.id.clone()))
    }

    fn lookup_server_id(&self, uid: &str) -> EngineResult<Option<String>> {
        if let Some(serverid) =
            self.ctx
                .store
                .folder_server_id(&self.ctx.device.id, &self.ctx.device.user, uid)?
        {
            return Ok(Some(serverid));
        }
        Ok(self.cache.folder(uid).map(|f| f.serverid.clone()))
    }

    /// Returns the changes to send for a collection, in delivery order.
    ///
    /// Changes left over from a previous window come first and suppress a
    /// new enumeration. The list is computed once per request; `ensure`
    /// ids move to the front without reordering anything else. With `ping`
    /// only the presence of changes matters, so at most one is returned and
    /// nothing is remembered.
    ///
    /// # Errors
    ///
    /// Returns `FolderGone`, `StaleState` or a backend error.
    pub fn get_collection_changes(
        &mut self,
        id: &str,
        state: &CollectionState,
        ping: bool,
        ensure: &[String],
    ) -> EngineResult<Vec<ChangeRecord>> {
        if !ping {
            if let Some(changes) = self.changes.get(id) {
                return Ok(changes.clone());
            }
        }
        let collection = self
            .collections
            .get(id)
            .ok_or_else(|| EngineError::MissingCollection(id.to_string()))?;
        let serverid = self.server_id(collection)?;

        let mut changes = match &state.pending {
            Some(pending) => pending.clone(),
            None => self.ctx.backend.enumerate_changes(&serverid, state)?,
        };
        if ping {
            changes.truncate(1);
            return Ok(changes);
        }
        if !ensure.is_empty() {
            let (mut first, rest): (Vec<_>, Vec<_>) = changes
                .into_iter()
                .partition(|change| ensure.contains(&change.id));
            first.extend(rest);
            changes = first;
        }
        debug!(collection = %id, count = changes.len(), "collection changes");
        self.changes.insert(id.to_string(), changes.clone());
        Ok(changes)
    }

    /// Forgets the remembered change lists.
    pub fn clear_changes(&mut self) {
        self.changes.clear();
    }

    /// Drops hierarchy changes the device already knows.
    ///
    /// A changed folder whose cached copy has the same name, parent and
    /// type is not sent again, and neither is the deletion of a folder the
    /// device never received.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder mapping cannot be read.
    pub fn validate_hierarchy_changes(&self, hierarchy: &mut HierarchyCache) -> EngineResult<()> {
        if hierarchy.is_empty() {
            return Ok(());
        }
        let store: &dyn StateStore = self.ctx.store.as_ref();
        let (device, user) = (&self.ctx.device.id, &self.ctx.device.user);

        let mut known = Vec::new();
        for folder in hierarchy.changed() {
            let Some(uid) = store.folder_uid(device, user, &folder.serverid)? else {
                continue;
            };
            let unchanged = self.cache.folder(&uid).map_or(false, |cached| {
                cached.displayname.as_deref() == Some(folder.displayname.as_str())
                    && cached.parentid.as_deref() == Some(folder.parentid.as_str())
                    && cached.folder_type == Some(folder.folder_type)
            });
            if unchanged {
                known.push(folder.serverid.clone());
            }
        }

        let mut unknown = Vec::new();
        for serverid in hierarchy.deleted() {
            let sent = match store.folder_uid(device, user, serverid)? {
                Some(uid) => self.cache.folder(&uid).is_some(),
                None => false,
            };
            if !sent {
                unknown.push(serverid.clone());
            }
        }

        if !known.is_empty() || !unknown.is_empty() {
            debug!(
                unchanged = known.len(),
                unknown_deletes = unknown.len(),
                "suppressing hierarchy changes known to the device"
            );
        }
        hierarchy.retain_changed(|folder| !known.contains(&folder.serverid));
        hierarchy.retain_deleted(|serverid| !unknown.iter().any(|u| u == serverid));
        Ok(())
    }
}

impl std::fmt::Debug for Collections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collections")
            .field("device", &self.ctx.device)
            .field("collections", &self.collections.keys().collect::<Vec<_>>())
            .field("imported_changes", &self.imported_changes)
            .field("hanging_sync", &self.hanging_sync)
            .finish_non_exhaustive()
    }
}
