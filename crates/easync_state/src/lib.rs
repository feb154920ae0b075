//! # easync State
//!
//! Durable session state for the easync ActiveSync core.
//!
//! This crate owns everything a device session must remember between
//! requests. It does not interpret the protocol beyond what it needs to
//! key and merge records.
//!
//! ## Design Principles
//!
//! - One [`SyncCacheRecord`] per device and user, saved through a
//!   [`DirtySet`] so a save only touches what the request changed
//! - One [`CollectionState`] per collection and synckey; synckey `"0"` is
//!   never stored
//! - Stores must be `Send + Sync`; concurrent requests share one store
//!
//! ## Available Stores
//!
//! - [`InMemoryStateStore`] - For testing and ephemeral sessions
//! - [`FileStateStore`] - For persistent sessions in a directory of JSON files
//!
//! ## Example
//!
//! ```rust
//! use easync_protocol::SyncKey;
//! use easync_state::{CollectionState, InMemoryStateStore, StateStore};
//!
//! let store = InMemoryStateStore::new();
//! let key = SyncKey::new_series();
//! store
//!     .save_collection_state("dev1", "alice", &CollectionState::new("c1", key.clone()))
//!     .unwrap();
//! let state = store.load_collection_state("dev1", "alice", "c1", &key).unwrap();
//! assert!(state.is_empty());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod collection_state;
mod error;
mod file;
mod memory;
mod record;
mod store;

pub use collection_state::{CollectionState, HIERARCHY_STATE_ID};
pub use error::{StateError, StateResult};
pub use file::FileStateStore;
pub use memory::InMemoryStateStore;
pub use record::{CacheField, CachedFolder, CollectionDirt, DirtySet, SyncCacheRecord};
pub use store::StateStore;
