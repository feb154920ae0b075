//! # easync Protocol
//!
//! Protocol types for the easync ActiveSync session core.
//!
//! This crate provides:
//! - `SyncKey` cursors (`"0"` or `{guid}counter`)
//! - `Collection`, the per-folder session record, and window size rules
//! - `ChangeRecord` and the baseline diff (`diff_states`)
//! - `FolderEntry` and folder type to class mapping
//! - Protocol status codes for SYNC, PING and FOLDERSYNC
//!
//! This is a pure protocol crate with no I/O operations. The WBXML codec
//! lives outside this workspace.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod collection;
mod error;
mod folder;
mod status;
mod synckey;

pub use change::{diff_states, ChangeFlags, ChangeKind, ChangeRecord, FlagState, ItemStat};
pub use collection::{
    normalize_window_size, BodyPreference, Collection, CollectionClass,
    CONFLICT_OVERWRITE_PIM, CONFLICT_OVERWRITE_SERVER, DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE,
    MIME_SUPPORT_NONE, TRUNCATION_8, TRUNCATION_ALL,
};
pub use error::{ProtocolError, ProtocolResult};
pub use folder::{
    class_for_folder_type, FolderEntry, FOLDER_TYPE_APPOINTMENT, FOLDER_TYPE_CONTACT,
    FOLDER_TYPE_GENERIC, FOLDER_TYPE_INBOX, FOLDER_TYPE_NOTE, FOLDER_TYPE_TASK,
    FOLDER_TYPE_USER_APPOINTMENT, FOLDER_TYPE_USER_CONTACT, FOLDER_TYPE_USER_MAIL,
    FOLDER_TYPE_USER_NOTE, FOLDER_TYPE_USER_TASK,
};
pub use status::{FolderSyncStatus, PingStatus, ProvisioningMode, RemoteWipeStatus, SyncStatus};
pub use synckey::SyncKey;
