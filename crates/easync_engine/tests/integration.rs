//! Integration tests for complete device sessions.

use easync_engine::{
    Device, EngineConfig, ManualClock, MemoryBackend, PingFolder, PingRequest, RequestHandler,
    SessionContext, SyncRequest, VERSION_FOURTEEN,
};
use easync_protocol::{
    Collection, CollectionClass, FolderEntry, PingStatus, ProvisioningMode, RemoteWipeStatus,
    SyncKey, SyncStatus, FOLDER_TYPE_CONTACT, FOLDER_TYPE_INBOX,
};
use easync_state::{
    CacheField, CollectionState, DirtySet, FileStateStore, InMemoryStateStore, StateResult,
    StateStore, SyncCacheRecord,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A store that lets another request "start" right when the session
/// first re-reads its heartbeat clock.
struct RacingStore {
    inner: InMemoryStateStore,
    armed: AtomicBool,
}

impl RacingStore {
    fn new() -> Self {
        Self {
            inner: InMemoryStateStore::new(),
            armed: AtomicBool::new(false),
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

impl StateStore for RacingStore {
    fn get_sync_cache(
        &self,
        device: &str,
        user: &str,
        fields: Option<&[CacheField]>,
    ) -> StateResult<SyncCacheRecord> {
        if fields.is_some() && self.armed.swap(false, Ordering::SeqCst) {
            let mut record = self.inner.get_sync_cache(device, user, None)?;
            record.lasthbsyncstarted = Some(record.lasthbsyncstarted.unwrap_or(0) + 1);
            let mut dirty = DirtySet::new();
            dirty.mark_field(CacheField::Lasthbsyncstarted);
            self.inner.save_sync_cache(&record, device, user, &dirty)?;
        }
        self.inner.get_sync_cache(device, user, fields)
    }

    fn save_sync_cache(
        &self,
        record: &SyncCacheRecord,
        device: &str,
        user: &str,
        dirty: &DirtySet,
    ) -> StateResult<()> {
        self.inner.save_sync_cache(record, device, user, dirty)
    }

    fn delete_sync_cache(&self, device: &str, user: &str) -> StateResult<()> {
        self.inner.delete_sync_cache(device, user)
    }

    fn list_sync_caches(&self) -> StateResult<Vec<(String, String)>> {
        self.inner.list_sync_caches()
    }

    fn read_collection_state(
        &self,
        device: &str,
        user: &str,
        collection: &str,
        synckey: &SyncKey,
    ) -> StateResult<Option<CollectionState>> {
        self.inner
            .read_collection_state(device, user, collection, synckey)
    }

    fn write_collection_state(
        &self,
        device: &str,
        user: &str,
        state: &CollectionState,
    ) -> StateResult<()> {
        self.inner.write_collection_state(device, user, state)
    }

    fn remove_collection_state(
        &self,
        device: &str,
        user: &str,
        collection: &str,
        synckey: Option<&SyncKey>,
    ) -> StateResult<()> {
        self.inner
            .remove_collection_state(device, user, collection, synckey)
    }

    fn collection_state_keys(
        &self,
        device: &str,
        user: &str,
        collection: &str,
    ) -> StateResult<Vec<SyncKey>> {
        self.inner.collection_state_keys(device, user, collection)
    }

    fn folder_server_id(
        &self,
        device: &str,
        user: &str,
        uid: &str,
    ) -> StateResult<Option<String>> {
        self.inner.folder_server_id(device, user, uid)
    }

    fn folder_uid(&self, device: &str, user: &str, serverid: &str) -> StateResult<Option<String>> {
        self.inner.folder_uid(device, user, serverid)
    }

    fn set_folder_mapping(
        &self,
        device: &str,
        user: &str,
        uid: &str,
        serverid: Option<&str>,
    ) -> StateResult<()> {
        self.inner.set_folder_mapping(device, user, uid, serverid)
    }

    fn device_rw_status(&self, device: &str) -> StateResult<RemoteWipeStatus> {
        self.inner.device_rw_status(device)
    }

    fn set_device_rw_status(&self, device: &str, status: RemoteWipeStatus) -> StateResult<()> {
        self.inner.set_device_rw_status(device, status)
    }
}

fn backend() -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    backend.add_folder(FolderEntry::new("inbox", "Inbox", FOLDER_TYPE_INBOX));
    backend.add_folder(FolderEntry::new("contacts", "Contacts", FOLDER_TYPE_CONTACT));
    backend
}

fn context(
    store: Arc<dyn StateStore>,
    backend: Arc<MemoryBackend>,
    clock: Arc<ManualClock>,
    config: EngineConfig,
) -> SessionContext {
    SessionContext::new(
        Device::new("dev1", "alice").with_version(VERSION_FOURTEEN),
        store,
        backend,
    )
    .with_clock(clock)
    .with_config(config)
}

/// Runs FOLDERSYNC from scratch and returns (inbox uid, contacts uid).
fn folder_sync(handler: &RequestHandler) -> (String, String) {
    let response = handler.handle_folder_sync(&SyncKey::zero());
    let uid = |name: &str| {
        response
            .changes
            .iter()
            .find(|c| c.displayname == name)
            .map(|c| c.uid.clone())
            .unwrap()
    };
    (uid("Inbox"), uid("Contacts"))
}

fn request(entries: &[(&str, CollectionClass, &SyncKey)]) -> SyncRequest {
    SyncRequest {
        collections: entries
            .iter()
            .map(|(id, class, key)| {
                Collection::new(*id)
                    .with_class(*class)
                    .with_synckey((*key).clone())
            })
            .collect(),
        ..SyncRequest::default()
    }
}

/// Syncs a collection from `"0"` and returns its first key.
fn first_key(handler: &RequestHandler, uid: &str, class: CollectionClass) -> SyncKey {
    let response = handler.handle_sync(request(&[(uid, class, &SyncKey::zero())]));
    response.collection(uid).unwrap().synckey.clone()
}

#[test]
fn newer_request_makes_ping_give_up_without_backend_calls() {
    let store = Arc::new(RacingStore::new());
    let backend = backend();
    let clock = Arc::new(ManualClock::new(50_000));
    let handler = RequestHandler::new(context(
        store.clone(),
        backend.clone(),
        clock.clone(),
        EngineConfig::new(),
    ));
    let (_, contacts) = folder_sync(&handler);
    first_key(&handler, &contacts, CollectionClass::Contacts);

    let calls = backend.calls();
    store.arm();
    let response = handler.handle_ping(PingRequest {
        heartbeat: Some(300),
        folders: vec![PingFolder {
            id: contacts,
            class: Some(CollectionClass::Contacts),
        }],
    });

    assert_eq!(response.status, None);
    assert_eq!(backend.calls(), calls);
    assert!(clock.sleeps().is_empty());
}

#[test]
fn newer_request_makes_looping_sync_send_nothing() {
    let store = Arc::new(RacingStore::new());
    let backend = backend();
    let clock = Arc::new(ManualClock::new(50_000));
    let handler = RequestHandler::new(context(
        store.clone(),
        backend.clone(),
        clock,
        EngineConfig::new(),
    ));
    let (_, contacts) = folder_sync(&handler);
    let key = first_key(&handler, &contacts, CollectionClass::Contacts);
    backend.put_item("contacts", "c1", "Ada").unwrap();

    store.arm();
    let mut looping = request(&[(&contacts, CollectionClass::Contacts, &key)]);
    looping.hbinterval = Some(120);
    let response = handler.handle_sync(looping);
    assert!(response.is_empty());
}

#[test]
fn looping_sync_returns_changes_seen_during_the_wait() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let backend = backend();
    let writer = backend.clone();
    let clock = Arc::new(ManualClock::new(50_000).with_sleep_hook(move |_| {
        writer.put_item("contacts", "c1", "Ada").unwrap();
    }));
    let handler = RequestHandler::new(context(
        store.clone(),
        backend,
        clock.clone(),
        EngineConfig::new(),
    ));
    let (_, contacts) = folder_sync(&handler);
    let key = first_key(&handler, &contacts, CollectionClass::Contacts);

    let mut looping = request(&[(&contacts, CollectionClass::Contacts, &key)]);
    looping.hbinterval = Some(120);
    let response = handler.handle_sync(looping);

    let entry = response.collection(&contacts).unwrap();
    assert_eq!(entry.entries.len(), 1);
    assert_eq!(entry.entries[0].id, "c1");
    assert_eq!(entry.synckey, key.next());
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(10)]);

    let cache = store.get_sync_cache("dev1", "alice", None).unwrap();
    assert!(cache.lastsyncendnormal >= cache.lasthbsyncstarted);
}

#[test]
fn quiet_looping_sync_sends_the_empty_response() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let clock = Arc::new(ManualClock::new(50_000));
    let handler = RequestHandler::new(context(
        store.clone(),
        backend(),
        clock.clone(),
        EngineConfig::new(),
    ));
    let (inbox, _) = folder_sync(&handler);
    let key = first_key(&handler, &inbox, CollectionClass::Email);

    let mut looping = request(&[(&inbox, CollectionClass::Email, &key)]);
    looping.wait = Some(1);
    let response = handler.handle_sync(looping);
    assert!(response.is_empty());
    assert_eq!(clock.sleeps().len(), 6);

    let cache = store.get_sync_cache("dev1", "alice", None).unwrap();
    assert_eq!(cache.wait, Some(1));
    assert_eq!(cache.lastsyncendnormal, Some(50_060));
}

#[test]
fn partial_sync_fills_in_unsent_collections() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let backend = backend();
    let handler = RequestHandler::new(context(
        store,
        backend.clone(),
        Arc::new(ManualClock::new(50_000)),
        EngineConfig::new(),
    ));
    let (inbox, contacts) = folder_sync(&handler);
    let zero = SyncKey::zero();
    let first = handler.handle_sync(request(&[
        (&inbox, CollectionClass::Email, &zero),
        (&contacts, CollectionClass::Contacts, &zero),
    ]));
    let inbox_key = first.collection(&inbox).unwrap().synckey.clone();
    let contacts_key = first.collection(&contacts).unwrap().synckey.clone();

    let settled = handler.handle_sync(request(&[
        (&inbox, CollectionClass::Email, &inbox_key),
        (&contacts, CollectionClass::Contacts, &contacts_key),
    ]));
    assert!(settled.collections.iter().all(|c| c.entries.is_empty()));

    backend.put_item("contacts", "c1", "Ada").unwrap();
    let mut partial = request(&[(&inbox, CollectionClass::Email, &inbox_key)]);
    partial.partial = true;
    let response = handler.handle_sync(partial);

    assert_eq!(response.status, None);
    assert_eq!(response.collections.len(), 2);
    let filled = response.collection(&contacts).unwrap();
    assert_eq!(filled.entries.len(), 1);
    assert_eq!(filled.synckey, contacts_key.next());
}

#[test]
fn partial_sync_with_unconfirmed_keys_requires_full_sync() {
    let handler = RequestHandler::new(context(
        Arc::new(InMemoryStateStore::new()),
        backend(),
        Arc::new(ManualClock::new(50_000)),
        EngineConfig::new(),
    ));
    let (inbox, contacts) = folder_sync(&handler);
    let zero = SyncKey::zero();
    let first = handler.handle_sync(request(&[
        (&inbox, CollectionClass::Email, &zero),
        (&contacts, CollectionClass::Contacts, &zero),
    ]));
    let inbox_key = first.collection(&inbox).unwrap().synckey.clone();

    let mut partial = request(&[(&inbox, CollectionClass::Email, &inbox_key)]);
    partial.partial = true;
    let response = handler.handle_sync(partial);
    assert_eq!(response.status, Some(SyncStatus::RequestIncomplete));
}

#[test]
fn replayed_synckey_is_detected_as_a_loop() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let backend = backend();
    let handler = RequestHandler::new(context(
        store.clone(),
        backend.clone(),
        Arc::new(ManualClock::new(50_000)),
        EngineConfig::new().with_max_synckey_count(1),
    ));
    let (_, contacts) = folder_sync(&handler);
    let key = first_key(&handler, &contacts, CollectionClass::Contacts);
    backend.put_item("contacts", "c1", "Ada").unwrap();

    for _ in 0..2 {
        let response = handler.handle_sync(request(&[(&contacts, CollectionClass::Contacts, &key)]));
        assert_eq!(response.collection(&contacts).unwrap().entries.len(), 1);
    }
    let response = handler.handle_sync(request(&[(&contacts, CollectionClass::Contacts, &key)]));
    assert_eq!(response.status, Some(SyncStatus::InvalidSyncKey));
    assert!(store
        .collection_state_keys("dev1", "alice", &contacts)
        .unwrap()
        .is_empty());
}

#[test]
fn pending_wipe_interrupts_ping() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let clock = Arc::new(ManualClock::new(50_000));
    let handler = RequestHandler::new(context(
        store.clone(),
        backend(),
        clock.clone(),
        EngineConfig::new().with_provisioning(ProvisioningMode::Enforced),
    ));
    let (_, contacts) = folder_sync(&handler);
    first_key(&handler, &contacts, CollectionClass::Contacts);

    store
        .set_device_rw_status("dev1", RemoteWipeStatus::Pending)
        .unwrap();
    let response = handler.handle_ping(PingRequest {
        heartbeat: Some(300),
        folders: vec![PingFolder {
            id: contacts,
            class: Some(CollectionClass::Contacts),
        }],
    });
    assert_eq!(response.status, Some(PingStatus::FolderSyncRequired));
    assert!(clock.sleeps().is_empty());
}

#[test]
fn vanished_folder_fails_the_whole_sync() {
    let backend = backend();
    let handler = RequestHandler::new(context(
        Arc::new(InMemoryStateStore::new()),
        backend.clone(),
        Arc::new(ManualClock::new(50_000)),
        EngineConfig::new(),
    ));
    let (_, contacts) = folder_sync(&handler);
    let key = first_key(&handler, &contacts, CollectionClass::Contacts);

    backend.remove_folder("contacts");
    let response = handler.handle_sync(request(&[(&contacts, CollectionClass::Contacts, &key)]));
    assert_eq!(response.status, Some(SyncStatus::FolderHierarchyChanged));
}

#[test]
fn sessions_resume_from_the_file_store() {
    let dir = TempDir::new().unwrap();
    let backend = backend();
    backend.put_item("contacts", "c1", "Ada").unwrap();
    backend.put_item("contacts", "c2", "Grace").unwrap();

    let open = || -> Arc<dyn StateStore> { Arc::new(FileStateStore::open(dir.path()).unwrap()) };
    let first = RequestHandler::new(context(
        open(),
        backend.clone(),
        Arc::new(ManualClock::new(50_000)),
        EngineConfig::new(),
    ));
    let (_, contacts) = folder_sync(&first);
    let key = first_key(&first, &contacts, CollectionClass::Contacts);
    let mut windowed = request(&[(&contacts, CollectionClass::Contacts, &key)]);
    windowed.collections[0].windowsize = Some(1);
    let response = first.handle_sync(windowed);
    let entry = response.collection(&contacts).unwrap();
    assert!(entry.more_available);
    let next = entry.synckey.clone();
    drop(first);

    let store = open();
    let second = RequestHandler::new(context(
        store.clone(),
        backend,
        Arc::new(ManualClock::new(50_100)),
        EngineConfig::new(),
    ));
    let response = second.handle_sync(request(&[(&contacts, CollectionClass::Contacts, &next)]));
    let entry = response.collection(&contacts).unwrap();
    assert_eq!(entry.entries.len(), 1);
    assert!(!entry.more_available);
    assert_eq!(entry.synckey, next.next());

    let keys = store
        .collection_state_keys("dev1", "alice", &contacts)
        .unwrap();
    assert!(keys.contains(&next.next()));
    assert!(!keys.contains(&key));
}
