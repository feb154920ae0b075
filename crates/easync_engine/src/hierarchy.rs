//! Collects folder hierarchy changes for a FOLDERSYNC response.

use crate::sync::{ExportItem, ExportOutcome, Exporter};
use easync_protocol::{ChangeKind, ChangeRecord, FolderEntry};

/// Folder changes gathered by a hierarchy sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HierarchyCache {
    changed: Vec<FolderEntry>,
    deleted: Vec<String>,
}

impl HierarchyCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an added or changed folder.
    pub fn change_folder(&mut self, folder: FolderEntry) {
        self.changed.retain(|f| f.serverid != folder.serverid);
        self.changed.push(folder);
    }

    /// Records a deleted folder.
    pub fn delete_folder(&mut self, serverid: impl Into<String>) {
        let serverid = serverid.into();
        if !self.deleted.contains(&serverid) {
            self.deleted.push(serverid);
        }
    }

    /// Returns added or changed folders.
    pub fn changed(&self) -> &[FolderEntry] {
        &self.changed
    }

    /// Returns deleted folder ids.
    pub fn deleted(&self) -> &[String] {
        &self.deleted
    }

    /// Returns the number of changes.
    pub fn count(&self) -> usize {
        self.changed.len() + self.deleted.len()
    }

    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Keeps the changed folders matching `keep`.
    pub fn retain_changed(&mut self, keep: impl FnMut(&FolderEntry) -> bool) {
        self.changed.retain(keep);
    }

    /// Keeps the deletions matching `keep`.
    pub fn retain_deleted(&mut self, keep: impl FnMut(&String) -> bool) {
        self.deleted.retain(keep);
    }
}

impl Exporter for HierarchyCache {
    fn export(&mut self, change: &ChangeRecord, item: Option<&ExportItem>) -> ExportOutcome {
        match (change.kind, item) {
            (ChangeKind::Change, Some(ExportItem::Folder(folder))) => {
                self.change_folder(folder.clone());
                ExportOutcome::Written
            }
            (ChangeKind::Delete, _) => {
                self.delete_folder(change.id.clone());
                ExportOutcome::Written
            }
            _ => ExportOutcome::Skipped,
        }
    }
}
