//! Per-collection synchronization state.

use easync_protocol::{ChangeFlags, ChangeKind, ChangeRecord, CollectionClass, ItemStat, SyncKey};
use serde::{Deserialize, Serialize};

/// Collection id under which the folder hierarchy state is stored.
pub const HIERARCHY_STATE_ID: &str = "hierarchy";

/// What the device is known to hold for one collection at one synckey.
///
/// The baseline lists the version stamp of every item the device has
/// received. `pending` holds changes that were computed for an earlier
/// response but did not fit its window; they are sent before anything new
/// is enumerated.
///
/// # Invariants
///
/// - a state stored under synckey `k` reflects exactly the changes the device
///   acknowledged by sending `k`
/// - `record_sent` is the only way a single change moves into the baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionState {
    /// Collection (folder UID) this state belongs to.
    pub collection_id: String,
    /// Synckey this state is stored under.
    pub synckey: SyncKey,
    /// Class of the collection, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<CollectionClass>,
    /// Items known to the device.
    #[serde(default)]
    pub baseline: Vec<ItemStat>,
    /// Changes computed but not yet sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<Vec<ChangeRecord>>,
    /// Unix seconds of the last sync that produced this state.
    #[serde(default)]
    pub last_sync: i64,
}

impl CollectionState {
    /// Creates an empty state (no baseline) for a collection.
    pub fn new(collection_id: impl Into<String>, synckey: SyncKey) -> Self {
        Self {
            collection_id: collection_id.into(),
            synckey,
            class: None,
            baseline: Vec::new(),
            pending: None,
            last_sync: 0,
        }
    }

    /// Creates an empty folder hierarchy state.
    pub fn hierarchy(synckey: SyncKey) -> Self {
        Self::new(HIERARCHY_STATE_ID, synckey)
    }

    /// Sets the class.
    #[must_use]
    pub fn with_class(mut self, class: CollectionClass) -> Self {
        self.class = Some(class);
        self
    }

    /// Returns true if the device holds nothing yet.
    pub fn is_empty(&self) -> bool {
        self.baseline.is_empty()
    }

    /// Returns the remembered stamp of an item.
    pub fn stat(&self, id: &str) -> Option<&ItemStat> {
        self.baseline.iter().find(|s| s.id == id)
    }

    /// Returns the number of changes waiting to be sent.
    pub fn pending_len(&self) -> usize {
        self.pending.as_ref().map_or(0, Vec::len)
    }

    /// Drops the baseline and any pending changes.
    pub fn reset(&mut self) {
        self.baseline.clear();
        self.pending = None;
    }

    /// Moves this state under a new synckey.
    pub fn rekey(&mut self, synckey: SyncKey, now: i64) {
        self.synckey = synckey;
        self.last_sync = now;
    }

    /// Folds one sent change into the baseline.
    ///
    /// `stat` is the item stamp observed while the change was streamed, or
    /// `None` if the item disappeared between enumeration and streaming; in
    /// that case the change is only dropped from `pending`.
    pub fn record_sent(&mut self, change: &ChangeRecord, stat: Option<ItemStat>) {
        if let Some(pending) = self.pending.as_mut() {
            if let Some(pos) = pending
                .iter()
                .position(|p| p.id == change.id && p.kind == change.kind)
            {
                pending.remove(pos);
            }
            if pending.is_empty() {
                self.pending = None;
            }
        }

        match change.kind {
            ChangeKind::Delete | ChangeKind::Move => {
                self.baseline.retain(|s| s.id != change.id);
            }
            ChangeKind::Change => {
                if let Some(stat) = stat {
                    self.upsert(stat);
                }
            }
            ChangeKind::Flags => {
                if let Some(ChangeFlags::State(flags)) = change.flags {
                    match self.baseline.iter_mut().find(|s| s.id == change.id) {
                        Some(existing) => existing.flags = Some(flags),
                        None => {
                            if let Some(stat) = stat {
                                self.upsert(stat.with_flags(flags));
                            }
                        }
                    }
                }
            }
        }
    }

    fn upsert(&mut self, stat: ItemStat) {
        match self.baseline.iter_mut().find(|s| s.id == stat.id) {
            Some(existing) => *existing = stat,
            None => self.baseline.push(stat),
        }
    }
}
