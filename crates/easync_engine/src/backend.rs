//! Backend driver abstraction.

use crate::error::{BackendError, BackendResult};
use easync_protocol::{
    diff_states, ChangeKind, ChangeRecord, CollectionClass, FlagState, FolderEntry, ItemStat,
};
use easync_state::CollectionState;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

/// An item as fetched from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendItem {
    /// Item id.
    pub id: String,
    /// Serialized item payload.
    pub body: String,
    /// True if `body` was cut to the requested truncation size.
    pub truncated: bool,
}

/// A groupware backend as seen by the session engine.
///
/// Backends enumerate changes against a baseline and serve items one at a
/// time. `stat_item` and `fetch_item` are separate round trips with no
/// transactional guarantee between them; callers must tolerate an item
/// changing (or vanishing) in between.
pub trait Backend: Send + Sync {
    /// Lists every folder the user can synchronize.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    fn folders(&self) -> BackendResult<Vec<FolderEntry>>;

    /// Looks up one folder.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::FolderGone`] if the folder does not exist.
    fn folder(&self, serverid: &str) -> BackendResult<FolderEntry>;

    /// Computes the changes between `state`'s baseline and the folder's
    /// current content, in delivery order.
    ///
    /// # Errors
    ///
    /// Returns `FolderGone`, `StaleState` or a transient error.
    fn enumerate_changes(
        &self,
        serverid: &str,
        state: &CollectionState,
    ) -> BackendResult<Vec<ChangeRecord>>;

    /// Returns the current stamp of an item, or `None` if it is gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    fn stat_item(&self, serverid: &str, id: &str) -> BackendResult<Option<ItemStat>>;

    /// Fetches an item, truncating its body to `truncation` bytes if set.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NotFound`] if the item is gone.
    fn fetch_item(
        &self,
        serverid: &str,
        id: &str,
        truncation: Option<u32>,
    ) -> BackendResult<BackendItem>;

    /// Computes folder hierarchy changes against a hierarchy baseline.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder list cannot be read.
    fn enumerate_folder_changes(
        &self,
        state: &CollectionState,
    ) -> BackendResult<Vec<ChangeRecord>> {
        let current: Vec<ItemStat> = self.folders()?.iter().map(FolderEntry::stat).collect();
        Ok(diff_states(&state.baseline, &current))
    }
}

#[derive(Debug, Clone)]
struct MemoryItem {
    stat: ItemStat,
    body: String,
}

#[derive(Debug, Clone)]
struct MemoryFolder {
    entry: FolderEntry,
    items: BTreeMap<String, MemoryItem>,
    moved_out: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct Inner {
    folders: BTreeMap<String, MemoryFolder>,
    failures: HashMap<String, BackendError>,
    revision: u64,
}

/// An in-memory backend for tests and demos.
///
/// Every write bumps a global revision that becomes the item's mod token.
/// Failures can be injected per folder, and every driver call is counted.
///
/// # Example
///
/// ```rust
/// use easync_engine::{Backend, MemoryBackend};
/// use easync_protocol::{FolderEntry, FOLDER_TYPE_CONTACT};
/// use easync_state::CollectionState;
/// use easync_protocol::SyncKey;
///
/// let backend = MemoryBackend::new();
/// backend.add_folder(FolderEntry::new("contacts", "Contacts", FOLDER_TYPE_CONTACT));
/// backend.put_item("contacts", "c1", "Jane").unwrap();
///
/// let changes = backend
///     .enumerate_changes("contacts", &CollectionState::new("F1", SyncKey::zero()))
///     .unwrap();
/// assert_eq!(changes.len(), 1);
/// assert!(changes[0].is_add());
/// ```
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: RwLock<Inner>,
    calls: AtomicUsize,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces the metadata of) a folder.
    pub fn add_folder(&self, entry: FolderEntry) {
        let mut inner = self.inner.write();
        match inner.folders.get_mut(&entry.serverid) {
            Some(folder) => folder.entry = entry,
            None => {
                inner.folders.insert(
                    entry.serverid.clone(),
                    MemoryFolder {
                        entry,
                        items: BTreeMap::new(),
                        moved_out: HashMap::new(),
                    },
                );
            }
        }
    }

    /// Removes a folder and its items.
    pub fn remove_folder(&self, serverid: &str) {
        self.inner.write().folders.remove(serverid);
    }

    /// Renames a folder.
    ///
    /// # Errors
    ///
    /// Returns `FolderGone` if the folder does not exist.
    pub fn rename_folder(&self, serverid: &str, displayname: &str) -> BackendResult<()> {
        let mut inner = self.inner.write();
        let folder = inner
            .folders
            .get_mut(serverid)
            .ok_or_else(|| BackendError::FolderGone(serverid.to_string()))?;
        folder.entry.displayname = displayname.to_string();
        Ok(())
    }

    /// Creates or overwrites an item.
    ///
    /// # Errors
    ///
    /// Returns `FolderGone` if the folder does not exist.
    pub fn put_item(&self, serverid: &str, id: &str, body: &str) -> BackendResult<()> {
        let mut inner = self.inner.write();
        inner.revision += 1;
        let revision = inner.revision.to_string();
        let folder = inner
            .folders
            .get_mut(serverid)
            .ok_or_else(|| BackendError::FolderGone(serverid.to_string()))?;
        let flags = match folder.entry.class() {
            CollectionClass::Email => Some(
                folder
                    .items
                    .get(id)
                    .and_then(|item| item.stat.flags)
                    .unwrap_or_default(),
            ),
            _ => None,
        };
        let mut stat = ItemStat::new(id, revision);
        stat.flags = flags;
        folder.moved_out.remove(id);
        folder.items.insert(
            id.to_string(),
            MemoryItem {
                stat,
                body: body.to_string(),
            },
        );
        Ok(())
    }

    /// Changes the read/flag state of a mail item without touching its body.
    ///
    /// # Errors
    ///
    /// Returns `FolderGone` or `NotFound`.
    pub fn set_flags(&self, serverid: &str, id: &str, flags: FlagState) -> BackendResult<()> {
        let mut inner = self.inner.write();
        let folder = inner
            .folders
            .get_mut(serverid)
            .ok_or_else(|| BackendError::FolderGone(serverid.to_string()))?;
        let item = folder
            .items
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
        item.stat.flags = Some(flags);
        Ok(())
    }

    /// Deletes an item.
    ///
    /// # Errors
    ///
    /// Returns `FolderGone` if the folder does not exist.
    pub fn delete_item(&self, serverid: &str, id: &str) -> BackendResult<()> {
        let mut inner = self.inner.write();
        let folder = inner
            .folders
            .get_mut(serverid)
            .ok_or_else(|| BackendError::FolderGone(serverid.to_string()))?;
        folder.items.remove(id);
        Ok(())
    }

    /// Moves an item between folders.
    ///
    /// The source folder reports the item as a `Move` until it is put back.
    ///
    /// # Errors
    ///
    /// Returns `FolderGone` or `NotFound`.
    pub fn move_item(&self, from: &str, to: &str, id: &str) -> BackendResult<()> {
        let mut inner = self.inner.write();
        if !inner.folders.contains_key(to) {
            return Err(BackendError::FolderGone(to.to_string()));
        }
        let source = inner
            .folders
            .get_mut(from)
            .ok_or_else(|| BackendError::FolderGone(from.to_string()))?;
        let item = source
            .items
            .remove(id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
        source.moved_out.insert(id.to_string(), to.to_string());
        if let Some(target) = inner.folders.get_mut(to) {
            target.items.insert(id.to_string(), item);
        }
        Ok(())
    }

    /// Makes every call touching `serverid` fail with `error`.
    pub fn fail_folder(&self, serverid: &str, error: BackendError) {
        self.inner
            .write()
            .failures
            .insert(serverid.to_string(), error);
    }

    /// Removes an injected failure.
    pub fn clear_failure(&self, serverid: &str) {
        self.inner.write().failures.remove(serverid);
    }

    /// Returns how many driver calls touched item data.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, inner: &Inner, serverid: &str) -> BackendResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = inner.failures.get(serverid) {
            return Err(err.clone());
        }
        Ok(())
    }
}

impl Backend for MemoryBackend {
    fn folders(&self) -> BackendResult<Vec<FolderEntry>> {
        let inner = self.inner.read();
        Ok(inner.folders.values().map(|f| f.entry.clone()).collect())
    }

    fn folder(&self, serverid: &str) -> BackendResult<FolderEntry> {
        let inner = self.inner.read();
        inner
            .folders
            .get(serverid)
            .map(|f| f.entry.clone())
            .ok_or_else(|| BackendError::FolderGone(serverid.to_string()))
    }

    fn enumerate_changes(
        &self,
        serverid: &str,
        state: &CollectionState,
    ) -> BackendResult<Vec<ChangeRecord>> {
        let inner = self.inner.read();
        self.check(&inner, serverid)?;
        let folder = inner
            .folders
            .get(serverid)
            .ok_or_else(|| BackendError::FolderGone(serverid.to_string()))?;

        let current: Vec<ItemStat> = folder.items.values().map(|i| i.stat.clone()).collect();
        let changes = diff_states(&state.baseline, &current)
            .into_iter()
            .map(|change| match folder.moved_out.get(&change.id) {
                Some(target) if change.kind == ChangeKind::Delete => {
                    ChangeRecord::moved(change.id, target.clone())
                }
                _ => change,
            })
            .collect();
        Ok(changes)
    }

    fn stat_item(&self, serverid: &str, id: &str) -> BackendResult<Option<ItemStat>> {
        let inner = self.inner.read();
        self.check(&inner, serverid)?;
        let folder = inner
            .folders
            .get(serverid)
            .ok_or_else(|| BackendError::FolderGone(serverid.to_string()))?;
        Ok(folder.items.get(id).map(|i| i.stat.clone()))
    }

    fn fetch_item(
        &self,
        serverid: &str,
        id: &str,
        truncation: Option<u32>,
    ) -> BackendResult<BackendItem> {
        let inner = self.inner.read();
        self.check(&inner, serverid)?;
        let folder = inner
            .folders
            .get(serverid)
            .ok_or_else(|| BackendError::FolderGone(serverid.to_string()))?;
        let item = folder
            .items
            .get(id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;

        let (body, truncated) = match truncation {
            Some(limit) if item.body.len() > limit as usize => {
                let mut end = limit as usize;
                while !item.body.is_char_boundary(end) {
                    end -= 1;
                }
                (item.body[..end].to_string(), true)
            }
            _ => (item.body.clone(), false),
        };
        Ok(BackendItem {
            id: id.to_string(),
            body,
            truncated,
        })
    }
}
