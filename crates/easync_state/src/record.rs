//! The durable sync cache record and its dirty tracking.

use easync_protocol::{Collection, CollectionClass, SyncKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A folder as remembered in the sync cache, keyed by folder UID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFolder {
    /// Collection class of the folder.
    pub class: CollectionClass,
    /// Backend folder id.
    pub serverid: String,
    /// Parent folder UID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parentid: Option<String>,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    /// Folder type code.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub folder_type: Option<u32>,
    /// Filter type reported to the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filtertype: Option<u32>,
}

impl CachedFolder {
    /// Creates a folder entry with only class and server id.
    pub fn new(class: CollectionClass, serverid: impl Into<String>) -> Self {
        Self {
            class,
            serverid: serverid.into(),
            parentid: None,
            displayname: None,
            folder_type: None,
            filtertype: None,
        }
    }
}

/// One sync cache record per device and user.
///
/// # Invariants
///
/// - `timestamp` and `lasthbsyncstarted` are only ever advanced by the
///   process that last wrote the record
/// - a collection's `synckey` is only durable once rotated into `lastsynckey`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncCacheRecord {
    /// Collection snapshots keyed by collection id.
    #[serde(default)]
    pub collections: BTreeMap<String, Collection>,
    /// Folder cache keyed by folder UID.
    #[serde(default)]
    pub folders: BTreeMap<String, CachedFolder>,
    /// Hierarchy synckey.
    #[serde(default)]
    pub hierarchy: Option<SyncKey>,
    /// Synckeys issued during a looping sync and awaiting confirmation.
    #[serde(default)]
    pub confirmed_synckeys: BTreeSet<SyncKey>,
    /// Heartbeat interval in seconds.
    #[serde(default)]
    pub hbinterval: Option<u64>,
    /// Wait interval in minutes.
    #[serde(default)]
    pub wait: Option<u64>,
    /// Heartbeat of the last PING request, in seconds.
    #[serde(default)]
    pub pingheartbeat: Option<u64>,
    /// Planned end of the last looping sync (unix seconds).
    #[serde(default)]
    pub lastuntil: Option<i64>,
    /// Start of the last looping sync (unix seconds).
    #[serde(default)]
    pub lasthbsyncstarted: Option<i64>,
    /// End of the last looping sync that ended normally (unix seconds).
    #[serde(default)]
    pub lastsyncendnormal: Option<i64>,
    /// Time of the last save (unix seconds).
    #[serde(default)]
    pub timestamp: i64,
    /// Replay counters per collection and synckey, for loop detection.
    #[serde(default)]
    pub synckeycounter: BTreeMap<String, BTreeMap<String, u32>>,
}

/// A top-level field of [`SyncCacheRecord`] other than `collections`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CacheField {
    /// `folders`
    Folders,
    /// `hierarchy`
    Hierarchy,
    /// `confirmed_synckeys`
    ConfirmedSynckeys,
    /// `hbinterval`
    Hbinterval,
    /// `wait`
    Wait,
    /// `pingheartbeat`
    Pingheartbeat,
    /// `lastuntil`
    Lastuntil,
    /// `lasthbsyncstarted`
    Lasthbsyncstarted,
    /// `lastsyncendnormal`
    Lastsyncendnormal,
    /// `timestamp`
    Timestamp,
    /// `synckeycounter`
    Synckeycounter,
}

impl CacheField {
    /// Every field, in declaration order.
    pub const ALL: [CacheField; 11] = [
        CacheField::Folders,
        CacheField::Hierarchy,
        CacheField::ConfirmedSynckeys,
        CacheField::Hbinterval,
        CacheField::Wait,
        CacheField::Pingheartbeat,
        CacheField::Lastuntil,
        CacheField::Lasthbsyncstarted,
        CacheField::Lastsyncendnormal,
        CacheField::Timestamp,
        CacheField::Synckeycounter,
    ];
}

/// How a collection entry changed since the record was loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionDirt {
    /// The entry was added or modified.
    Updated,
    /// The entry was deleted.
    Removed,
}

/// The parts of a record written since it was loaded.
///
/// Saves only write what is dirty, so unrelated requests touching other
/// fields or other collections of the same record do not overwrite each
/// other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtySet {
    fields: BTreeSet<CacheField>,
    collections: BTreeMap<String, CollectionDirt>,
}

impl DirtySet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set covering every field and the given collections.
    pub fn everything<'a>(collections: impl IntoIterator<Item = &'a String>) -> Self {
        Self {
            fields: CacheField::ALL.iter().copied().collect(),
            collections: collections
                .into_iter()
                .map(|id| (id.clone(), CollectionDirt::Updated))
                .collect(),
        }
    }

    /// Marks a field dirty.
    pub fn mark_field(&mut self, field: CacheField) {
        self.fields.insert(field);
    }

    /// Marks a collection as added or modified.
    pub fn mark_collection(&mut self, id: &str) {
        self.collections
            .insert(id.to_string(), CollectionDirt::Updated);
    }

    /// Marks a collection as deleted.
    pub fn mark_removed(&mut self, id: &str) {
        self.collections
            .insert(id.to_string(), CollectionDirt::Removed);
    }

    /// Returns true if nothing is dirty.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.collections.is_empty()
    }

    /// Returns true if `field` is dirty.
    pub fn has_field(&self, field: CacheField) -> bool {
        self.fields.contains(&field)
    }

    /// Returns the dirt recorded for a collection.
    pub fn collection(&self, id: &str) -> Option<CollectionDirt> {
        self.collections.get(id).copied()
    }

    /// Iterates dirty fields.
    pub fn fields(&self) -> impl Iterator<Item = CacheField> + '_ {
        self.fields.iter().copied()
    }

    /// Iterates dirty collections.
    pub fn collections(&self) -> impl Iterator<Item = (&str, CollectionDirt)> + '_ {
        self.collections.iter().map(|(id, dirt)| (id.as_str(), *dirt))
    }

    /// Forgets collection dirt, keeping dirty fields.
    pub fn clear_collections(&mut self) {
        self.collections.clear();
    }

    /// Clears all dirt.
    pub fn clear(&mut self) {
        self.fields.clear();
        self.collections.clear();
    }
}

impl SyncCacheRecord {
    /// Copies one field from `source`.
    pub fn copy_field(&mut self, source: &SyncCacheRecord, field: CacheField) {
        match field {
            CacheField::Folders => self.folders = source.folders.clone(),
            CacheField::Hierarchy => self.hierarchy = source.hierarchy.clone(),
            CacheField::ConfirmedSynckeys => {
                self.confirmed_synckeys = source.confirmed_synckeys.clone()
            }
            CacheField::Hbinterval => self.hbinterval = source.hbinterval,
            CacheField::Wait => self.wait = source.wait,
            CacheField::Pingheartbeat => self.pingheartbeat = source.pingheartbeat,
            CacheField::Lastuntil => self.lastuntil = source.lastuntil,
            CacheField::Lasthbsyncstarted => self.lasthbsyncstarted = source.lasthbsyncstarted,
            CacheField::Lastsyncendnormal => self.lastsyncendnormal = source.lastsyncendnormal,
            CacheField::Timestamp => self.timestamp = source.timestamp,
            CacheField::Synckeycounter => self.synckeycounter = source.synckeycounter.clone(),
        }
    }

    /// Returns a record holding only `fields`; everything else is default.
    pub fn project(&self, fields: &[CacheField]) -> SyncCacheRecord {
        let mut projected = SyncCacheRecord::default();
        for field in fields {
            projected.copy_field(self, *field);
        }
        projected
    }

    /// Applies the dirty parts of `source` onto this record.
    ///
    /// This is how a store folds a partial save into the stored record:
    /// clean fields and clean collections of `self` are left untouched.
    pub fn apply_dirty(&mut self, source: &SyncCacheRecord, dirty: &DirtySet) {
        for field in dirty.fields() {
            self.copy_field(source, field);
        }
        for (id, dirt) in dirty.collections() {
            match (dirt, source.collections.get(id)) {
                (CollectionDirt::Updated, Some(collection)) => {
                    self.collections.insert(id.to_string(), collection.clone());
                }
                (CollectionDirt::Updated, None) | (CollectionDirt::Removed, _) => {
                    self.collections.remove(id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with(ids: &[&str]) -> SyncCacheRecord {
        let mut record = SyncCacheRecord::default();
        for id in ids {
            record
                .collections
                .insert(id.to_string(), Collection::new(*id));
        }
        record
    }

    #[test]
    fn projection_keeps_only_requested_fields() {
        let mut record = record_with(&["a"]);
        record.timestamp = 10;
        record.lasthbsyncstarted = Some(7);
        record.wait = Some(3);

        let projected = record.project(&[CacheField::Timestamp, CacheField::Lasthbsyncstarted]);
        assert_eq!(projected.timestamp, 10);
        assert_eq!(projected.lasthbsyncstarted, Some(7));
        assert_eq!(projected.wait, None);
        assert!(projected.collections.is_empty());
    }

    #[test]
    fn apply_dirty_leaves_clean_parts_alone() {
        let mut stored = record_with(&["a", "b"]);
        stored.wait = Some(5);
        stored.hbinterval = Some(100);

        let mut ours = record_with(&["a", "c"]);
        ours.hbinterval = Some(200);
        ours.collections.get_mut("a").unwrap().windowsize = Some(25);

        let mut dirty = DirtySet::new();
        dirty.mark_field(CacheField::Hbinterval);
        dirty.mark_collection("a");
        dirty.mark_collection("c");

        stored.apply_dirty(&ours, &dirty);

        assert_eq!(stored.hbinterval, Some(200));
        assert_eq!(stored.wait, Some(5));
        assert_eq!(stored.collections["a"].windowsize, Some(25));
        assert!(stored.collections.contains_key("b"));
        assert!(stored.collections.contains_key("c"));
    }

    #[test]
    fn apply_dirty_removes() {
        let mut stored = record_with(&["a", "b"]);
        let ours = record_with(&["b"]);
        let mut dirty = DirtySet::new();
        dirty.mark_removed("a");
        stored.apply_dirty(&ours, &dirty);
        assert!(!stored.collections.contains_key("a"));
        assert!(stored.collections.contains_key("b"));
    }

    #[test]
    fn dirty_set_bookkeeping() {
        let mut dirty = DirtySet::new();
        assert!(dirty.is_empty());
        dirty.mark_collection("a");
        dirty.mark_removed("a");
        assert_eq!(dirty.collection("a"), Some(CollectionDirt::Removed));
        dirty.mark_field(CacheField::Wait);
        assert!(dirty.has_field(CacheField::Wait));
        dirty.clear();
        assert!(dirty.is_empty());

        let ids = vec!["x".to_string()];
        let all = DirtySet::everything(&ids);
        assert_eq!(all.fields().count(), CacheField::ALL.len());
        assert_eq!(all.collection("x"), Some(CollectionDirt::Updated));
    }
}
