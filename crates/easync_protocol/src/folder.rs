//! Folder hierarchy entries.

use crate::change::ItemStat;
use crate::collection::CollectionClass;
use serde::{Deserialize, Serialize};

/// Folder type code: user-created generic folder.
pub const FOLDER_TYPE_GENERIC: u32 = 1;
/// Folder type code: default inbox.
pub const FOLDER_TYPE_INBOX: u32 = 2;
/// Folder type code: default tasks.
pub const FOLDER_TYPE_TASK: u32 = 7;
/// Folder type code: default calendar.
pub const FOLDER_TYPE_APPOINTMENT: u32 = 8;
/// Folder type code: default contacts.
pub const FOLDER_TYPE_CONTACT: u32 = 9;
/// Folder type code: default notes.
pub const FOLDER_TYPE_NOTE: u32 = 10;
/// Folder type code: user-created mail folder.
pub const FOLDER_TYPE_USER_MAIL: u32 = 12;
/// Folder type code: user-created calendar.
pub const FOLDER_TYPE_USER_APPOINTMENT: u32 = 13;
/// Folder type code: user-created contacts.
pub const FOLDER_TYPE_USER_CONTACT: u32 = 14;
/// Folder type code: user-created tasks.
pub const FOLDER_TYPE_USER_TASK: u32 = 15;
/// Folder type code: user-created notes.
pub const FOLDER_TYPE_USER_NOTE: u32 = 17;

/// Maps a folder type code to the class of its collection.
///
/// Anything that is not a task, calendar, contact or note folder is mail.
pub fn class_for_folder_type(folder_type: u32) -> CollectionClass {
    match folder_type {
        FOLDER_TYPE_TASK | FOLDER_TYPE_USER_TASK => CollectionClass::Tasks,
        FOLDER_TYPE_APPOINTMENT | FOLDER_TYPE_USER_APPOINTMENT => CollectionClass::Calendar,
        FOLDER_TYPE_CONTACT | FOLDER_TYPE_USER_CONTACT => CollectionClass::Contacts,
        FOLDER_TYPE_NOTE | FOLDER_TYPE_USER_NOTE => CollectionClass::Notes,
        _ => CollectionClass::Email,
    }
}

/// A folder as reported by the backend and sent in a hierarchy sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderEntry {
    /// Backend folder id.
    pub serverid: String,
    /// Parent folder id, `"0"` for top level.
    pub parentid: String,
    /// Display name.
    pub displayname: String,
    /// Folder type code.
    #[serde(rename = "type")]
    pub folder_type: u32,
}

impl FolderEntry {
    /// Creates a top-level folder entry.
    pub fn new(
        serverid: impl Into<String>,
        displayname: impl Into<String>,
        folder_type: u32,
    ) -> Self {
        Self {
            serverid: serverid.into(),
            parentid: "0".to_string(),
            displayname: displayname.into(),
            folder_type,
        }
    }

    /// Sets the parent folder.
    #[must_use]
    pub fn with_parent(mut self, parentid: impl Into<String>) -> Self {
        self.parentid = parentid.into();
        self
    }

    /// Returns the collection class of this folder.
    pub fn class(&self) -> CollectionClass {
        class_for_folder_type(self.folder_type)
    }

    /// Returns the baseline stamp of this folder.
    ///
    /// Only the name and the parent of a folder can change, so the display
    /// name serves as the modification token.
    pub fn stat(&self) -> ItemStat {
        ItemStat::new(self.serverid.clone(), self.displayname.clone())
            .with_parent(self.parentid.clone())
    }
}
