//! # easync Engine
//!
//! Session core of an ActiveSync server.
//!
//! This crate provides:
//! - The per-device sync cache, saved field by field
//! - The working set of collections for one request, including PARTIAL
//!   sync reconciliation and the long poll behind PING and looping SYNC
//! - The diff driver that exports changes in windowed steps
//! - Request handlers for SYNC, PING and FOLDERSYNC
//!
//! ## Architecture
//!
//! A request is served in three layers:
//! 1. [`Collections`] merges the request with the [`SyncCache`]
//! 2. [`SyncDriver`] walks the changes of one collection and hands each to
//!    an [`Exporter`] ([`Streamer`] for items, [`HierarchyCache`] for folders)
//! 3. [`RequestHandler`] issues synckeys and translates errors to statuses
//!
//! Backends plug in through the [`Backend`] trait, persistence through
//! [`easync_state::StateStore`] and time through [`Clock`].
//!
//! ## Key Invariants
//!
//! - At most one long poll per device runs to completion; a newer request
//!   makes the older one give up
//! - A synckey is only issued once the state it names is stored
//! - Changes that did not fit a response are sent first in the next one
//!
//! ## Example
//!
//! ```rust
//! use easync_engine::{Device, MemoryBackend, RequestHandler, SessionContext};
//! use easync_protocol::{FolderEntry, FolderSyncStatus, SyncKey, FOLDER_TYPE_CONTACT};
//! use easync_state::InMemoryStateStore;
//! use std::sync::Arc;
//!
//! let backend = Arc::new(MemoryBackend::new());
//! backend.add_folder(FolderEntry::new("contacts", "Contacts", FOLDER_TYPE_CONTACT));
//! let ctx = SessionContext::new(
//!     Device::new("dev1", "alice"),
//!     Arc::new(InMemoryStateStore::new()),
//!     backend,
//! );
//! let handler = RequestHandler::new(ctx);
//! let response = handler.handle_folder_sync(&SyncKey::zero());
//! assert_eq!(response.status, FolderSyncStatus::Success);
//! assert_eq!(response.changes.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod clock;
mod collections;
mod config;
mod error;
mod handler;
mod hierarchy;
mod session;
mod streamer;
mod sync;
mod sync_cache;

pub use backend::{Backend, BackendItem, MemoryBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collections::{collection_digest, normalized_snapshot, Collections, PollOptions};
pub use config::EngineConfig;
pub use error::{BackendError, BackendResult, CollectionError, EngineError, EngineResult};
pub use handler::{
    CollectionResponse, FolderChange, FolderSyncResponse, PingFolder, PingRequest, PingResponse,
    RequestHandler, SyncRequest, SyncResponse,
};
pub use hierarchy::HierarchyCache;
pub use session::{
    Device, SessionContext, VERSION_FOURTEEN, VERSION_FOURTEEN_ONE, VERSION_TWELVE,
    VERSION_TWELVE_ONE,
};
pub use streamer::{EncodeError, EnvelopeBuffer, EnvelopeEntry, StreamEvent, Streamer, WireEncoder};
pub use sync::{
    DriverState, ExportItem, ExportOutcome, Exporter, SyncDriver, SyncFlags, SyncKind, SyncProgress,
};
pub use sync_cache::{SyncCache, UpdateOptions};
