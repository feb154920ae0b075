//! The diff driver: moves changes to an exporter one at a time.

use crate::backend::{Backend, BackendItem};
use crate::error::{BackendError, EngineError, EngineResult};
use easync_protocol::{ChangeKind, ChangeRecord, FolderEntry, ItemStat};
use easync_state::CollectionState;
use std::sync::Arc;
use tracing::{debug, trace};

/// What a driver synchronizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncKind {
    /// Items of one backend folder.
    Collection {
        /// Backend folder id.
        serverid: String,
        /// Body truncation in bytes, if any.
        truncation: Option<u32>,
    },
    /// The folder hierarchy.
    Hierarchy,
}

/// Lifecycle of a [`SyncDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Not bound to a change list yet.
    Idle,
    /// Changes remain.
    Streaming,
    /// Every change was handled.
    Done,
}

/// Data handed to an exporter along with a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportItem {
    /// A fetched item.
    Message(BackendItem),
    /// A folder of the hierarchy.
    Folder(FolderEntry),
}

/// How an exporter handled a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportOutcome {
    /// The change was written to the response.
    Written,
    /// The change needs no output (already sent, or irrelevant).
    Skipped,
    /// The change could not be written; it must be offered again later.
    Rejected,
}

impl ExportOutcome {
    /// Returns true if the driver may move past the change.
    pub fn is_accepted(&self) -> bool {
        !matches!(self, ExportOutcome::Rejected)
    }
}

/// Receives changes from a [`SyncDriver`].
pub trait Exporter {
    /// Handles one change. `item` is present for content changes.
    fn export(&mut self, change: &ChangeRecord, item: Option<&ExportItem>) -> ExportOutcome;
}

/// Flags for [`SyncDriver::synchronize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncFlags {
    /// Advance the state without exporting anything.
    pub discard: bool,
}

/// Result of one [`SyncDriver::synchronize`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncProgress {
    /// One change was handled and folded into the state.
    Advanced {
        /// Number of changes.
        total: usize,
        /// Changes handled so far.
        done: usize,
    },
    /// The exporter refused the current change; the state did not move.
    Rejected {
        /// Number of changes.
        total: usize,
        /// Changes handled so far.
        done: usize,
    },
    /// No changes remain.
    Exhausted,
}

/// Walks a change list and advances a collection state one change at a
/// time.
///
/// A change enters the state only after the exporter accepted it (or the
/// driver runs in discard mode), so a state saved after an interrupted
/// response never claims more than the device received. Items are stat'ed
/// and fetched in two backend calls; an item that changes in between is
/// simply reported again by the next enumeration.
pub struct SyncDriver {
    backend: Arc<dyn Backend>,
    kind: SyncKind,
    state: Option<CollectionState>,
    changes: Vec<ChangeRecord>,
    step: usize,
    status: DriverState,
}

impl SyncDriver {
    /// Creates an idle driver.
    pub fn new(backend: Arc<dyn Backend>, kind: SyncKind) -> Self {
        Self {
            backend,
            kind,
            state: None,
            changes: Vec::new(),
            step: 0,
            status: DriverState::Idle,
        }
    }

    /// Binds the driver to a state and the changes to apply to it.
    pub fn init(&mut self, state: CollectionState, changes: Vec<ChangeRecord>) {
        debug!(
            collection = %state.collection_id,
            changes = changes.len(),
            "initializing sync driver"
        );
        self.status = if changes.is_empty() {
            DriverState::Done
        } else {
            DriverState::Streaming
        };
        self.state = Some(state);
        self.changes = changes;
        self.step = 0;
    }

    /// Returns the lifecycle state.
    pub fn status(&self) -> DriverState {
        self.status
    }

    /// Returns the number of changes bound to the driver.
    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    /// Returns the number of changes handled so far.
    pub fn steps_done(&self) -> usize {
        self.step
    }

    /// Returns true if changes remain.
    pub fn has_remaining(&self) -> bool {
        self.step < self.changes.len()
    }

    /// Returns the state as advanced so far.
    pub fn state(&self) -> Option<&CollectionState> {
        self.state.as_ref()
    }

    /// Handles the next change.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` before [`SyncDriver::init`], or the
    /// backend's error. An item that vanished is not an error; it is
    /// dropped and the driver moves on.
    pub fn synchronize(
        &mut self,
        exporter: &mut dyn Exporter,
        flags: SyncFlags,
    ) -> EngineResult<SyncProgress> {
        if self.status == DriverState::Idle {
            return Err(EngineError::invalid_request("sync driver not initialized"));
        }
        let total = self.changes.len();
        let Some(change) = self.changes.get(self.step).cloned() else {
            self.status = DriverState::Done;
            return Ok(SyncProgress::Exhausted);
        };

        let (outcome, stat) = match &self.kind {
            SyncKind::Collection {
                serverid,
                truncation,
            } => self.export_item(serverid, *truncation, &change, exporter, flags)?,
            SyncKind::Hierarchy => self.export_folder(&change, exporter, flags)?,
        };

        if !outcome.is_accepted() {
            trace!(id = %change.id, step = self.step, "exporter rejected change");
            return Ok(SyncProgress::Rejected {
                total,
                done: self.step,
            });
        }

        if let Some(state) = self.state.as_mut() {
            state.record_sent(&change, stat);
        }
        self.step += 1;
        if self.step == total {
            self.status = DriverState::Done;
        }
        Ok(SyncProgress::Advanced {
            total,
            done: self.step,
        })
    }

    fn export_item(
        &self,
        serverid: &str,
        truncation: Option<u32>,
        change: &ChangeRecord,
        exporter: &mut dyn Exporter,
        flags: SyncFlags,
    ) -> EngineResult<(ExportOutcome, Option<ItemStat>)> {
        match change.kind {
            ChangeKind::Change => {
                let Some(stat) = self.backend.stat_item(serverid, &change.id)? else {
                    debug!(id = %change.id, "item vanished before export");
                    return Ok((ExportOutcome::Skipped, None));
                };
                if flags.discard {
                    return Ok((ExportOutcome::Skipped, Some(stat)));
                }
                match self.backend.fetch_item(serverid, &change.id, truncation) {
                    Ok(item) => {
                        let outcome = exporter.export(change, Some(&ExportItem::Message(item)));
                        Ok((outcome, Some(stat)))
                    }
                    Err(BackendError::NotFound(_)) => {
                        debug!(id = %change.id, "item vanished during fetch");
                        Ok((ExportOutcome::Skipped, None))
                    }
                    Err(err) => Err(err.into()),
                }
            }
            ChangeKind::Flags => {
                let stat = self.backend.stat_item(serverid, &change.id)?;
                if flags.discard {
                    return Ok((ExportOutcome::Skipped, stat));
                }
                Ok((exporter.export(change, None), stat))
            }
            ChangeKind::Delete | ChangeKind::Move => {
                if flags.discard {
                    return Ok((ExportOutcome::Skipped, None));
                }
                Ok((exporter.export(change, None), None))
            }
        }
    }

    fn export_folder(
        &self,
        change: &ChangeRecord,
        exporter: &mut dyn Exporter,
        flags: SyncFlags,
    ) -> EngineResult<(ExportOutcome, Option<ItemStat>)> {
        match change.kind {
            ChangeKind::Change => match self.backend.folder(&change.id) {
                Ok(folder) => {
                    let stat = folder.stat();
                    if flags.discard {
                        return Ok((ExportOutcome::Skipped, Some(stat)));
                    }
                    let outcome = exporter.export(change, Some(&ExportItem::Folder(folder)));
                    Ok((outcome, Some(stat)))
                }
                Err(BackendError::FolderGone(_)) => Ok((ExportOutcome::Skipped, None)),
                Err(err) => Err(err.into()),
            },
            _ => {
                if flags.discard {
                    return Ok((ExportOutcome::Skipped, None));
                }
                Ok((exporter.export(change, None), None))
            }
        }
    }

    /// Releases the state. Changes not handled yet become its pending
    /// list, to be sent first by the next response.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` before [`SyncDriver::init`].
    pub fn finish(self) -> EngineResult<CollectionState> {
        let mut state = self
            .state
            .ok_or_else(|| EngineError::invalid_request("sync driver not initialized"))?;
        let remaining: Vec<ChangeRecord> = self.changes.into_iter().skip(self.step).collect();
        state.pending = if remaining.is_empty() {
            None
        } else {
            Some(remaining)
        };
        Ok(state)
    }
}

impl std::fmt::Debug for SyncDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncDriver")
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("step", &self.step)
            .field("changes", &self.changes.len())
            .finish_non_exhaustive()
    }
}
