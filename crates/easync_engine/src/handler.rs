//! Request handlers for the SYNC, PING and FOLDERSYNC commands.
//!
//! Handlers never fail: every error is translated to the status code the
//! command reports, and logged.

use crate::collections::{Collections, PollOptions};
use crate::error::{BackendError, EngineError, EngineResult};
use crate::hierarchy::HierarchyCache;
use crate::session::SessionContext;
use crate::streamer::{EnvelopeBuffer, EnvelopeEntry, Streamer};
use crate::sync::{SyncDriver, SyncFlags, SyncKind, SyncProgress};
use crate::sync_cache::UpdateOptions;
use easync_protocol::{
    Collection, CollectionClass, FolderEntry, FolderSyncStatus, PingStatus, SyncKey, SyncStatus,
};
use easync_state::{CollectionState, StateStore, HIERARCHY_STATE_ID};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A SYNC request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Collections to synchronize. Empty means "same as last time".
    #[serde(default)]
    pub collections: Vec<Collection>,
    /// Only the listed collections changed since the last request.
    #[serde(default)]
    pub partial: bool,
    /// Looping interval in minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<u64>,
    /// Looping interval in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hbinterval: Option<u64>,
    /// Window size for every collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windowsize: Option<u32>,
}

/// The result of one collection in a SYNC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionResponse {
    /// Collection id.
    pub id: String,
    /// Collection class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<CollectionClass>,
    /// Synckey the client must send next.
    pub synckey: SyncKey,
    /// Collection status.
    pub status: SyncStatus,
    /// Server changes.
    #[serde(default)]
    pub entries: Vec<EnvelopeEntry>,
    /// Items the client asked to fetch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fetched: Vec<EnvelopeEntry>,
    /// Client ids of imported items mapped to server ids.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub replies: BTreeMap<String, String>,
    /// More changes are waiting.
    #[serde(default)]
    pub more_available: bool,
}

impl CollectionResponse {
    fn new(collection: &Collection, synckey: SyncKey, status: SyncStatus) -> Self {
        Self {
            id: collection.id.clone(),
            class: collection.class,
            synckey,
            status,
            entries: Vec::new(),
            fetched: Vec::new(),
            replies: BTreeMap::new(),
            more_available: false,
        }
    }
}

/// A SYNC response.
///
/// A response without status and collections is the empty response: the
/// client repeats its last request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Top-level status, set when the whole request failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SyncStatus>,
    /// Per-collection results.
    #[serde(default)]
    pub collections: Vec<CollectionResponse>,
}

impl SyncResponse {
    /// The empty response.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A response carrying only a top-level status.
    pub fn error(status: SyncStatus) -> Self {
        Self {
            status: Some(status),
            collections: Vec::new(),
        }
    }

    /// Returns true for the empty response.
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.collections.is_empty()
    }

    /// Returns the result of one collection.
    pub fn collection(&self, id: &str) -> Option<&CollectionResponse> {
        self.collections.iter().find(|c| c.id == id)
    }
}

/// A folder named in a PING request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingFolder {
    /// Collection id.
    pub id: String,
    /// Collection class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<CollectionClass>,
}

/// A PING request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    /// Heartbeat in seconds; absent means the last one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<u64>,
    /// Folders to watch; empty means the last ones.
    #[serde(default)]
    pub folders: Vec<PingFolder>,
}

/// A PING response.
///
/// `status == None` means no body: a newer request took over the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    /// Status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PingStatus>,
    /// Folders with changes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub folders: Vec<String>,
    /// The acceptable heartbeat, sent with `HeartbeatOutOfBounds`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<u64>,
}

impl PingResponse {
    fn status(status: PingStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// A folder sent in a FOLDERSYNC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderChange {
    /// Folder UID.
    pub uid: String,
    /// Parent folder UID, `"0"` for top level.
    pub parent_uid: String,
    /// Display name.
    pub displayname: String,
    /// Folder type code.
    #[serde(rename = "type")]
    pub folder_type: u32,
    /// First time the device sees this folder.
    pub added: bool,
}

/// A FOLDERSYNC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderSyncResponse {
    /// Status.
    pub status: FolderSyncStatus,
    /// Hierarchy synckey the client must send next.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synckey: Option<SyncKey>,
    /// Added or changed folders.
    #[serde(default)]
    pub changes: Vec<FolderChange>,
    /// UIDs of deleted folders.
    #[serde(default)]
    pub deleted: Vec<String>,
}

impl FolderSyncResponse {
    fn status(status: FolderSyncStatus) -> Self {
        Self {
            status,
            synckey: None,
            changes: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

/// Handler for device requests.
pub struct RequestHandler {
    ctx: SessionContext,
}

impl RequestHandler {
    /// Creates a handler for one device session.
    pub fn new(ctx: SessionContext) -> Self {
        Self { ctx }
    }

    /// Returns the session context.
    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Handles a SYNC request.
    pub fn handle_sync(&self, request: SyncRequest) -> SyncResponse {
        match self.run_sync(request) {
            Ok(response) => response,
            Err(err) => {
                error!(device = %self.ctx.device.id, error = %err, "sync failed");
                SyncResponse::error(err.status())
            }
        }
    }

    fn run_sync(&self, request: SyncRequest) -> EngineResult<SyncResponse> {
        let config = &self.ctx.config;
        if let Some(hbinterval) = request.hbinterval {
            if !config.heartbeat_in_bounds(hbinterval) {
                warn!(hbinterval, "heartbeat interval out of bounds");
                return Ok(SyncResponse::error(SyncStatus::InvalidWaitOrHeartbeat));
            }
        }
        if let Some(wait) = request.wait {
            if !config.heartbeat_in_bounds(wait.saturating_mul(60)) {
                warn!(wait, "wait interval out of bounds");
                return Ok(SyncResponse::error(SyncStatus::InvalidWaitOrHeartbeat));
            }
        }

        let mut collections = Collections::new(self.ctx.clone())?;
        let short = request.collections.is_empty();
        if let Some(window) = request.windowsize {
            collections.set_default_window_size(window);
        }
        if short || request.partial {
            collections.set_heartbeat(request.wait, request.hbinterval);
        } else {
            collections.cache_mut().set_wait(request.wait);
            collections.cache_mut().set_hbinterval(request.hbinterval);
        }

        if short {
            collections.set_short_sync_request(true);
            if !collections.have_syncable_collections(self.ctx.device.version) {
                info!(
                    device = %self.ctx.device.id,
                    "empty sync request without cached collections"
                );
                return Ok(SyncResponse::error(SyncStatus::RequestIncomplete));
            }
        } else {
            for collection in request.collections {
                if collection.synckey.is_none() {
                    warn!(collection = %collection.id, "collection without synckey");
                    return Ok(SyncResponse::error(SyncStatus::ProtocolError));
                }
                collections.add_collection(collection, false)?;
            }
            if request.partial {
                if !collections.init_partial_sync()? {
                    return Ok(SyncResponse::error(SyncStatus::RequestIncomplete));
                }
                collections.get_missing_collections_from_cache();
            } else {
                collections.init_full_sync();
            }
        }
        collections.validate_from_cache();

        if !collections.check_filter_type()? || !collections.check_loop_counters()? {
            return Ok(SyncResponse::error(SyncStatus::InvalidSyncKey));
        }
        collections.update_cache();

        let mut looping = false;
        if collections.can_do_looping_sync() {
            if let Some(heartbeat) = collections.heartbeat() {
                looping = true;
                collections.set_hanging_sync(true);
                let until = self.ctx.now() + heartbeat as i64;
                collections.cache_mut().set_lastuntil(Some(until));
                let interval = config.ping_interval.as_secs();
                match collections.poll_for_changes(heartbeat, interval, PollOptions::default()) {
                    Ok(true) => {}
                    Ok(false) => {
                        if collections.can_send_empty_response() {
                            self.end_looping_sync(&mut collections);
                            collections.save()?;
                            return Ok(SyncResponse::empty());
                        }
                    }
                    Err(err) => {
                        info!(device = %self.ctx.device.id, error = %err, "looping sync ended");
                        return Ok(match err.sync_status() {
                            Some(status) => SyncResponse::error(status),
                            None => SyncResponse::empty(),
                        });
                    }
                }
            }
        }

        let mut responses = Vec::new();
        for id in collections.ids() {
            let Some(collection) = collections.collection(&id).cloned() else {
                continue;
            };
            if looping && !collection.getchanges {
                continue;
            }
            match self.sync_collection(&mut collections, collection.clone()) {
                Ok(response) => responses.push(response),
                Err(err) if err.is_session_wide() => {
                    warn!(collection = %id, error = %err, "sync aborted");
                    if matches!(err, EngineError::FolderGone(_)) {
                        collections.cache_mut().remove_collection(&id, true);
                        collections.save()?;
                    }
                    return Ok(SyncResponse::error(err.status()));
                }
                Err(err) => {
                    responses.push(self.collection_error(&mut collections, &collection, err)?)
                }
            }
        }

        if looping {
            self.end_looping_sync(&mut collections);
        }
        collections.save()?;
        Ok(SyncResponse {
            status: None,
            collections: responses,
        })
    }

    fn end_looping_sync(&self, collections: &mut Collections) {
        let now = self.ctx.now();
        collections.cache_mut().set_lastsyncendnormal(Some(now));
        collections.cache_mut().set_lastuntil(Some(now));
    }

    fn sync_collection(
        &self,
        collections: &mut Collections,
        mut collection: Collection,
    ) -> EngineResult<CollectionResponse> {
        let id = collection.id.clone();
        let synckey = collection.synckey.clone().ok_or_else(|| {
            EngineError::invalid_request(format!("collection {id} has no synckey"))
        })?;
        let (device, user) = (&self.ctx.device.id, &self.ctx.device.user);
        let now = self.ctx.now();

        if synckey.is_zero() {
            let new_key = SyncKey::new_series();
            debug!(collection = %id, synckey = %new_key, "starting a new synckey series");
            let mut state = CollectionState::new(&id, new_key.clone());
            state.class = collection.class;
            state.last_sync = now;
            self.ctx.store.save_collection_state(device, user, &state)?;
            self.issue_key(collections, &mut collection, new_key.clone());
            return Ok(CollectionResponse::new(&collection, new_key, SyncStatus::Success));
        }

        let state = collections.init_collection_state(&collection)?;
        let serverid = collections.server_id(&collection)?;
        collection.serverid.get_or_insert_with(|| serverid.clone());
        let fetched = self.fetch_requested(&serverid, &collection)?;
        let changes = collections.get_collection_changes(&id, &state, false, &collection.ensure)?;

        let window = collection.effective_window_size() as usize;
        let mut driver = SyncDriver::new(
            Arc::clone(&self.ctx.backend),
            SyncKind::Collection {
                serverid,
                truncation: collection.body_truncation(),
            },
        );
        driver.init(state, changes);
        let mut streamer = Streamer::new(EnvelopeBuffer::with_limit(window), collection.class);
        loop {
            match driver.synchronize(&mut streamer, SyncFlags::default())? {
                SyncProgress::Advanced { .. } => {}
                SyncProgress::Rejected { .. } | SyncProgress::Exhausted => break,
            }
        }

        let more_available = driver.has_remaining();
        let advanced = driver.steps_done() > 0;
        let mut state = driver.finish()?;

        let mut response =
            CollectionResponse::new(&collection, synckey.clone(), SyncStatus::Success);
        response.entries = streamer.into_inner().into_entries();
        response.fetched = fetched;
        response.replies = collection.clientids.clone();
        response.more_available = more_available;

        if advanced || more_available || collection.importedchanges {
            let new_key = synckey.next();
            debug!(
                collection = %id,
                synckey = %new_key,
                sent = response.entries.len(),
                more_available,
                "issuing synckey"
            );
            if advanced || more_available {
                collections.increment_loop_counter(&id, &synckey);
            }
            state.rekey(new_key.clone(), now);
            self.ctx.store.save_collection_state(device, user, &state)?;
            self.issue_key(collections, &mut collection, new_key.clone());
            response.synckey = new_key;
        } else {
            collections.cache_mut().update_collection(
                &collection,
                UpdateOptions {
                    new_synckey: false,
                    unset_changes: true,
                },
            );
        }
        if collections.cache().has_ping_change(&id) {
            collections.cache_mut().reset_ping_change(&id)?;
        }
        Ok(response)
    }

    fn issue_key(&self, collections: &mut Collections, collection: &mut Collection, key: SyncKey) {
        collection.newsynckey = Some(key.clone());
        let cache = collections.cache_mut();
        cache.add_confirmed_key(key);
        cache.update_collection(
            collection,
            UpdateOptions {
                new_synckey: true,
                unset_changes: true,
            },
        );
    }

    fn fetch_requested(
        &self,
        serverid: &str,
        collection: &Collection,
    ) -> EngineResult<Vec<EnvelopeEntry>> {
        let mut fetched = Vec::new();
        for id in &collection.fetchids {
            match self.ctx.backend.fetch_item(serverid, id, None) {
                Ok(item) => fetched.push(EnvelopeEntry {
                    op: "fetch".into(),
                    id: item.id,
                    body: Some(item.body),
                    truncated: item.truncated,
                    flags: None,
                    parent: None,
                }),
                Err(BackendError::NotFound(_)) => {
                    warn!(collection = %collection.id, item = %id, "fetched item not found");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(fetched)
    }

    fn collection_error(
        &self,
        collections: &mut Collections,
        collection: &Collection,
        err: EngineError,
    ) -> EngineResult<CollectionResponse> {
        let status = err.status();
        warn!(
            collection = %collection.id,
            error = %err,
            status = status.code(),
            "collection failed"
        );
        let mut synckey = collection.synckey.clone().unwrap_or_else(SyncKey::zero);
        if status == SyncStatus::InvalidSyncKey {
            self.ctx.store.remove_collection_state(
                &self.ctx.device.id,
                &self.ctx.device.user,
                &collection.id,
                None,
            )?;
            collections.cache_mut().remove_collection(&collection.id, false);
            synckey = SyncKey::zero();
        }
        Ok(CollectionResponse::new(collection, synckey, status))
    }

    /// Handles a PING request.
    pub fn handle_ping(&self, request: PingRequest) -> PingResponse {
        match self.run_ping(request) {
            Ok(response) => response,
            Err(err) => {
                error!(device = %self.ctx.device.id, error = %err, "ping failed");
                let status = match err {
                    EngineError::StateGone { .. } | EngineError::FolderGone(_) => {
                        PingStatus::FolderSyncRequired
                    }
                    EngineError::InvalidRequest(_) | EngineError::Protocol(_) => {
                        PingStatus::ProtocolError
                    }
                    _ => PingStatus::ServerError,
                };
                PingResponse::status(status)
            }
        }
    }

    fn run_ping(&self, request: PingRequest) -> EngineResult<PingResponse> {
        let mut collections = Collections::new(self.ctx.clone())?;
        let Some(heartbeat) = request.heartbeat.or(collections.cache().pingheartbeat()) else {
            return Ok(PingResponse::status(PingStatus::MissingParameters));
        };
        let config = &self.ctx.config;
        if !config.heartbeat_in_bounds(heartbeat) {
            warn!(heartbeat, "ping heartbeat out of bounds");
            return Ok(PingResponse {
                status: Some(PingStatus::HeartbeatOutOfBounds),
                folders: Vec::new(),
                heartbeat: Some(config.clamp_heartbeat(heartbeat)),
            });
        }
        collections.cache_mut().set_pingheartbeat(Some(heartbeat));

        if request.folders.is_empty() {
            collections.load_collections_from_cache()?;
            let unwatched: Vec<String> = collections
                .ids()
                .into_iter()
                .filter(|id| !collections.cache().is_pingable(id))
                .collect();
            if unwatched.len() == collections.collection_count() {
                info!(device = %self.ctx.device.id, "ping without folders and none remembered");
                return Ok(PingResponse::status(PingStatus::MissingParameters));
            }
        } else {
            for folder in &request.folders {
                let mut collection = Collection::new(folder.id.clone());
                collection.class = folder.class;
                collections.add_collection(collection, true)?;
            }
            for cached in collections.cache().collections(false) {
                let watched = request.folders.iter().any(|f| f.id == cached.id);
                if watched {
                    collections.cache_mut().set_pingable(&cached.id)?;
                } else if collections.cache().is_pingable(&cached.id) {
                    collections.cache_mut().remove_pingable(&cached.id)?;
                }
            }
        }

        let interval = config.ping_interval.as_secs();
        let polled = collections.poll_for_changes(heartbeat, interval, PollOptions::pingable());
        let response = match polled {
            Ok(true) => {
                let changed: Vec<String> = collections
                    .iter()
                    .filter(|c| c.getchanges)
                    .map(|c| c.id.clone())
                    .collect();
                for id in &changed {
                    collections.cache_mut().set_ping_change(id)?;
                }
                info!(device = %self.ctx.device.id, folders = changed.len(), "ping found changes");
                PingResponse {
                    status: Some(PingStatus::ChangesFound),
                    folders: changed,
                    heartbeat: None,
                }
            }
            Ok(false) => PingResponse::status(PingStatus::HeartbeatExpired),
            Err(err) => {
                info!(device = %self.ctx.device.id, error = %err, "ping ended");
                return Ok(PingResponse {
                    status: err.ping_status(),
                    ..PingResponse::default()
                });
            }
        };
        collections.save()?;
        Ok(response)
    }

    /// Handles a FOLDERSYNC request.
    pub fn handle_folder_sync(&self, synckey: &SyncKey) -> FolderSyncResponse {
        match self.run_folder_sync(synckey) {
            Ok(response) => response,
            Err(err) => {
                error!(device = %self.ctx.device.id, error = %err, "folder sync failed");
                let status = match err {
                    EngineError::StateGone { .. } | EngineError::StaleState(_) => {
                        FolderSyncStatus::InvalidSyncKey
                    }
                    EngineError::InvalidRequest(_) | EngineError::Protocol(_) => {
                        FolderSyncStatus::ProtocolError
                    }
                    _ => FolderSyncStatus::ServerError,
                };
                FolderSyncResponse::status(status)
            }
        }
    }

    fn run_folder_sync(&self, synckey: &SyncKey) -> EngineResult<FolderSyncResponse> {
        let store: &dyn StateStore = self.ctx.store.as_ref();
        let (device, user) = (&self.ctx.device.id, &self.ctx.device.user);
        let mut collections = Collections::new(self.ctx.clone())?;

        let state = if synckey.is_zero() {
            info!(%device, "initial folder sync, resetting hierarchy");
            collections.cache_mut().clear_folders();
            collections.cache_mut().set_hierarchy(None);
            store.remove_collection_state(device, user, HIERARCHY_STATE_ID, None)?;
            CollectionState::hierarchy(SyncKey::zero())
        } else {
            store.load_collection_state(device, user, HIERARCHY_STATE_ID, synckey)?
        };

        let changes = self.ctx.backend.enumerate_folder_changes(&state)?;
        let mut driver = SyncDriver::new(Arc::clone(&self.ctx.backend), SyncKind::Hierarchy);
        driver.init(state, changes);
        let mut hierarchy = HierarchyCache::new();
        while let SyncProgress::Advanced { .. } =
            driver.synchronize(&mut hierarchy, SyncFlags::default())?
        {}
        let mut state = driver.finish()?;
        collections.validate_hierarchy_changes(&mut hierarchy)?;

        let mut response = FolderSyncResponse::status(FolderSyncStatus::Success);
        for folder in hierarchy.changed() {
            let (uid, added) = self.folder_uid(&folder.serverid)?;
            let parent_uid = if folder.parentid == "0" {
                "0".to_string()
            } else {
                self.folder_uid(&folder.parentid)?.0
            };
            collections.cache_mut().update_folder(&uid, folder);
            response.changes.push(change_for(folder, uid, parent_uid, added));
        }
        for serverid in hierarchy.deleted() {
            let Some(uid) = store.folder_uid(device, user, serverid)? else {
                continue;
            };
            collections.cache_mut().delete_folder(&uid);
            store.set_folder_mapping(device, user, &uid, None)?;
            store.remove_collection_state(device, user, &uid, None)?;
            response.deleted.push(uid);
        }

        let new_key = if synckey.is_zero() {
            SyncKey::new_series()
        } else if hierarchy.is_empty() {
            synckey.clone()
        } else {
            synckey.next()
        };
        if new_key != *synckey {
            state.rekey(new_key.clone(), self.ctx.now());
            store.save_collection_state(device, user, &state)?;
        }
        debug!(
            %device,
            synckey = %new_key,
            changes = response.changes.len(),
            deleted = response.deleted.len(),
            "folder sync complete"
        );
        collections.cache_mut().set_hierarchy(Some(new_key.clone()));
        collections.save()?;
        response.synckey = Some(new_key);
        Ok(response)
    }

    /// Returns the UID of a backend folder, minting and recording one if
    /// the device has none yet. The flag is true for a new UID.
    fn folder_uid(&self, serverid: &str) -> EngineResult<(String, bool)> {
        let store: &dyn StateStore = self.ctx.store.as_ref();
        let (device, user) = (&self.ctx.device.id, &self.ctx.device.user);
        if let Some(uid) = store.folder_uid(device, user, serverid)? {
            return Ok((uid, false));
        }
        let mut attempt = 0u32;
        loop {
            let uid = mint_folder_uid(serverid, attempt);
            match store.folder_server_id(device, user, &uid)? {
                Some(taken) if taken != serverid => attempt += 1,
                _ => {
                    store.set_folder_mapping(device, user, &uid, Some(serverid))?;
                    debug!(%serverid, %uid, "assigned folder uid");
                    return Ok((uid, true));
                }
            }
        }
    }
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler")
            .field("ctx", &self.ctx)
            .finish()
    }
}

/// Derives a short UID for a backend folder id. Equal inputs always give
/// equal UIDs; `attempt` resolves collisions.
fn mint_folder_uid(serverid: &str, attempt: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serverid.as_bytes());
    if attempt > 0 {
        hasher.update(attempt.to_be_bytes());
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("F{hex}")
}

fn change_for(folder: &FolderEntry, uid: String, parent_uid: String, added: bool) -> FolderChange {
    FolderChange {
        uid,
        parent_uid,
        displayname: folder.displayname.clone(),
        folder_type: folder.folder_type,
        added,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::session::{Device, VERSION_FOURTEEN};
    use easync_protocol::{FOLDER_TYPE_CONTACT, FOLDER_TYPE_INBOX};
    use easync_state::InMemoryStateStore;
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryStateStore>,
        backend: Arc<MemoryBackend>,
        clock: Arc<ManualClock>,
        handler: RequestHandler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStateStore::new());
        let backend = Arc::new(MemoryBackend::new());
        backend.add_folder(FolderEntry::new("inbox", "Inbox", FOLDER_TYPE_INBOX));
        backend.add_folder(FolderEntry::new("contacts", "Contacts", FOLDER_TYPE_CONTACT));
        let clock = Arc::new(ManualClock::new(10_000));
        let ctx = SessionContext::new(
            Device::new("dev1", "alice").with_version(VERSION_FOURTEEN),
            store.clone(),
            backend.clone(),
        )
        .with_clock(clock.clone())
        .with_config(
            EngineConfig::new()
                .with_ping_interval(Duration::from_secs(10))
                .with_heartbeat_bounds(Duration::from_secs(60), Duration::from_secs(3600)),
        );
        Fixture {
            store,
            backend,
            clock,
            handler: RequestHandler::new(ctx),
        }
    }

    fn uid_of(response: &FolderSyncResponse, name: &str) -> String {
        response
            .changes
            .iter()
            .find(|c| c.displayname == name)
            .map(|c| c.uid.clone())
            .unwrap()
    }

    fn contacts_request(uid: &str, synckey: SyncKey) -> SyncRequest {
        SyncRequest {
            collections: vec![Collection::new(uid)
                .with_class(CollectionClass::Contacts)
                .with_synckey(synckey)],
            ..SyncRequest::default()
        }
    }

    #[test]
    fn initial_folder_sync_assigns_uids() {
        let fx = fixture();
        let response = fx.handler.handle_folder_sync(&SyncKey::zero());
        assert_eq!(response.status, FolderSyncStatus::Success);
        assert_eq!(response.changes.len(), 2);
        assert!(response.changes.iter().all(|c| c.added && c.uid.starts_with('F')));
        let key = response.synckey.unwrap();
        assert_eq!(key.counter(), 1);

        let again = fx.handler.handle_folder_sync(&key);
        assert_eq!(again.status, FolderSyncStatus::Success);
        assert!(again.changes.is_empty());
        assert_eq!(again.synckey, Some(key));
    }

    #[test]
    fn folder_sync_reports_renames_and_deletes() {
        let fx = fixture();
        let first = fx.handler.handle_folder_sync(&SyncKey::zero());
        let contacts = uid_of(&first, "Contacts");
        let inbox = uid_of(&first, "Inbox");
        let key = first.synckey.unwrap();

        fx.backend.rename_folder("contacts", "People").unwrap();
        fx.backend.remove_folder("inbox");
        let second = fx.handler.handle_folder_sync(&key);
        assert_eq!(second.changes.len(), 1);
        assert_eq!(second.changes[0].uid, contacts);
        assert!(!second.changes[0].added);
        assert_eq!(second.deleted, vec![inbox]);
        assert_eq!(second.synckey, Some(key.next()));
    }

    #[test]
    fn unknown_hierarchy_key_is_invalid() {
        let fx = fixture();
        let response = fx.handler.handle_folder_sync(&SyncKey::new_series());
        assert_eq!(response.status, FolderSyncStatus::InvalidSyncKey);
    }

    #[test]
    fn first_sync_issues_key_then_streams_items() {
        let fx = fixture();
        let uid = uid_of(&fx.handler.handle_folder_sync(&SyncKey::zero()), "Contacts");
        fx.backend.put_item("contacts", "c1", "Ada").unwrap();
        fx.backend.put_item("contacts", "c2", "Grace").unwrap();

        let first = fx.handler.handle_sync(contacts_request(&uid, SyncKey::zero()));
        let entry = first.collection(&uid).unwrap();
        assert_eq!(entry.status, SyncStatus::Success);
        assert!(entry.entries.is_empty());
        let key = entry.synckey.clone();
        assert_eq!(key.counter(), 1);

        let second = fx.handler.handle_sync(contacts_request(&uid, key.clone()));
        let entry = second.collection(&uid).unwrap();
        assert_eq!(entry.entries.len(), 2);
        assert!(entry.entries.iter().all(|e| e.op == "add"));
        assert!(!entry.more_available);
        assert_eq!(entry.synckey, key.next());

        let third = fx.handler.handle_sync(contacts_request(&uid, key.next()));
        let entry = third.collection(&uid).unwrap();
        assert!(entry.entries.is_empty());
        assert_eq!(entry.synckey, key.next());
    }

    #[test]
    fn window_size_splits_responses() {
        let fx = fixture();
        let uid = uid_of(&fx.handler.handle_folder_sync(&SyncKey::zero()), "Contacts");
        for i in 0..5 {
            fx.backend
                .put_item("contacts", &format!("c{i}"), "body")
                .unwrap();
        }
        let key = fx
            .handler
            .handle_sync(contacts_request(&uid, SyncKey::zero()))
            .collections[0]
            .synckey
            .clone();

        let mut request = contacts_request(&uid, key);
        request.collections[0].windowsize = Some(2);
        let first = fx.handler.handle_sync(request);
        let entry = &first.collections[0];
        assert_eq!(entry.entries.len(), 2);
        assert!(entry.more_available);

        let mut request = contacts_request(&uid, entry.synckey.clone());
        request.collections[0].windowsize = Some(2);
        let second = fx.handler.handle_sync(request);
        let next = &second.collections[0];
        assert_eq!(next.entries.len(), 2);
        let sent: Vec<&str> = entry
            .entries
            .iter()
            .chain(next.entries.iter())
            .map(|e| e.id.as_str())
            .collect();
        let mut unique = sent.clone();
        unique.dedup();
        assert_eq!(sent, unique);
    }

    #[test]
    fn unknown_synckey_resets_collection() {
        let fx = fixture();
        let uid = uid_of(&fx.handler.handle_folder_sync(&SyncKey::zero()), "Contacts");
        let response = fx
            .handler
            .handle_sync(contacts_request(&uid, SyncKey::new_series()));
        let entry = response.collection(&uid).unwrap();
        assert_eq!(entry.status, SyncStatus::InvalidSyncKey);
        assert!(entry.synckey.is_zero());
    }

    #[test]
    fn heartbeat_out_of_bounds_is_rejected() {
        let fx = fixture();
        let mut request = contacts_request("F1", SyncKey::zero());
        request.hbinterval = Some(5);
        let response = fx.handler.handle_sync(request);
        assert_eq!(response.status, Some(SyncStatus::InvalidWaitOrHeartbeat));

        let ping = fx.handler.handle_ping(PingRequest {
            heartbeat: Some(7200),
            folders: Vec::new(),
        });
        assert_eq!(ping.status, Some(PingStatus::HeartbeatOutOfBounds));
        assert_eq!(ping.heartbeat, Some(3600));
    }

    #[test]
    fn empty_request_without_cache_is_incomplete() {
        let fx = fixture();
        let response = fx.handler.handle_sync(SyncRequest::default());
        assert_eq!(response.status, Some(SyncStatus::RequestIncomplete));
    }

    #[test]
    fn ping_without_parameters() {
        let fx = fixture();
        let response = fx.handler.handle_ping(PingRequest::default());
        assert_eq!(response.status, Some(PingStatus::MissingParameters));
    }

    #[test]
    fn ping_reports_changed_folders() {
        let fx = fixture();
        let uid = uid_of(&fx.handler.handle_folder_sync(&SyncKey::zero()), "Contacts");
        let key = fx
            .handler
            .handle_sync(contacts_request(&uid, SyncKey::zero()))
            .collections[0]
            .synckey
            .clone();
        fx.handler.handle_sync(contacts_request(&uid, key));

        let request = PingRequest {
            heartbeat: Some(60),
            folders: vec![PingFolder {
                id: uid.clone(),
                class: Some(CollectionClass::Contacts),
            }],
        };
        let quiet = fx.handler.handle_ping(request.clone());
        assert_eq!(quiet.status, Some(PingStatus::HeartbeatExpired));
        assert_eq!(fx.clock.sleeps().len(), 6);

        fx.backend.put_item("contacts", "c9", "new").unwrap();
        let busy = fx.handler.handle_ping(PingRequest {
            heartbeat: None,
            folders: Vec::new(),
        });
        assert_eq!(busy.status, Some(PingStatus::ChangesFound));
        assert_eq!(busy.folders, vec![uid.clone()]);

        let cached = fx.store.get_sync_cache("dev1", "alice", None).unwrap();
        assert!(cached.collections[&uid].pingchange);
    }

    #[test]
    fn ping_on_unsynced_folder_requires_folder_sync() {
        let fx = fixture();
        let response = fx.handler.handle_ping(PingRequest {
            heartbeat: Some(60),
            folders: vec![PingFolder {
                id: "Funknown".into(),
                class: None,
            }],
        });
        assert_eq!(response.status, Some(PingStatus::FolderSyncRequired));
    }

    #[test]
    fn minted_uids_are_stable() {
        assert_eq!(mint_folder_uid("inbox", 0), mint_folder_uid("inbox", 0));
        assert_ne!(mint_folder_uid("inbox", 0), mint_folder_uid("inbox", 1));
        assert_eq!(mint_folder_uid("inbox", 0).len(), 9);
    }
}
