//! Collections: one synchronized folder within a device session.

use crate::error::{ProtocolError, ProtocolResult};
use crate::synckey::SyncKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Largest window a client may negotiate.
pub const MAX_WINDOW_SIZE: u32 = 512;

/// Window size used when neither the client nor the cache supplies one.
pub const DEFAULT_WINDOW_SIZE: u32 = 100;

/// Truncation code meaning "send everything".
pub const TRUNCATION_ALL: u32 = 9;

/// Default MIME truncation code.
pub const TRUNCATION_8: u32 = 8;

/// Conflict resolution: server data overwrites the client.
pub const CONFLICT_OVERWRITE_SERVER: u32 = 0;

/// Conflict resolution: client data overwrites the server.
pub const CONFLICT_OVERWRITE_PIM: u32 = 1;

/// MIME support: never send MIME.
pub const MIME_SUPPORT_NONE: u32 = 0;

/// Normalizes a client-requested window size.
///
/// A window of `0` or anything above [`MAX_WINDOW_SIZE`] is treated as
/// [`MAX_WINDOW_SIZE`].
pub fn normalize_window_size(requested: u32) -> u32 {
    if requested == 0 || requested > MAX_WINDOW_SIZE {
        MAX_WINDOW_SIZE
    } else {
        requested
    }
}

/// The folder type tag of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CollectionClass {
    /// Mail folders.
    Email,
    /// Address books.
    Contacts,
    /// Calendars.
    Calendar,
    /// Task lists.
    Tasks,
    /// Notes.
    Notes,
}

impl CollectionClass {
    /// Returns the wire name of the class.
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionClass::Email => "Email",
            CollectionClass::Contacts => "Contacts",
            CollectionClass::Calendar => "Calendar",
            CollectionClass::Tasks => "Tasks",
            CollectionClass::Notes => "Notes",
        }
    }

    /// Parses a wire class name.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownClass`] for any other name.
    pub fn parse(name: &str) -> ProtocolResult<Self> {
        match name {
            "Email" => Ok(CollectionClass::Email),
            "Contacts" => Ok(CollectionClass::Contacts),
            "Calendar" => Ok(CollectionClass::Calendar),
            "Tasks" => Ok(CollectionClass::Tasks),
            "Notes" => Ok(CollectionClass::Notes),
            other => Err(ProtocolError::UnknownClass(other.to_string())),
        }
    }

    /// Returns true if read-flag-only changes are meaningful for this class.
    pub fn supports_flag_changes(&self) -> bool {
        matches!(self, CollectionClass::Email)
    }
}

impl fmt::Display for CollectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client body preference for one body type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyPreference {
    /// Body type (1 plain, 2 html, 3 rtf, 4 mime).
    #[serde(rename = "type")]
    pub body_type: u32,
    /// Truncate bodies to this many bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncationsize: Option<u32>,
    /// Send the body only if it fits untruncated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allornone: Option<bool>,
    /// Preview length in characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<u32>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// One synchronized folder in a device session.
///
/// A collection combines what the client sent in the current request with
/// what the server remembers in its sync cache. Optional fields are absent
/// when neither side supplied them.
///
/// # Invariants
///
/// - `synckey == "0"` means there is no baseline and a full resync is required
/// - `id` is unique per device and user; `serverid` may change across renames
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    /// Opaque folder UID as known to the device.
    pub id: String,
    /// Backend folder identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serverid: Option<String>,
    /// Folder type tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<CollectionClass>,
    /// Current cursor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synckey: Option<SyncKey>,
    /// Previous, durable cursor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lastsynckey: Option<SyncKey>,
    /// Cursor issued in the current response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newsynckey: Option<SyncKey>,
    /// Maximum number of changes per response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windowsize: Option<u32>,
    /// Plain body truncation code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncation: Option<u32>,
    /// RTF body truncation code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtftruncation: Option<u32>,
    /// MIME body truncation code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetruncation: Option<u32>,
    /// MIME support level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimesupport: Option<u32>,
    /// Conflict resolution policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<u32>,
    /// Body preferences keyed by body type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bodyprefs: Option<BTreeMap<String, BodyPreference>>,
    /// Time-window filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filtertype: Option<u32>,
    /// Client deletes should become moves to the waste basket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletesasmoves: Option<bool>,
    /// Server changes must be polled for this collection this round.
    #[serde(default, skip_serializing_if = "is_false")]
    pub getchanges: bool,
    /// Eligible for PING.
    #[serde(default, skip_serializing_if = "is_false")]
    pub pingable: bool,
    /// A PING detected changes not yet picked up by a SYNC.
    #[serde(default, skip_serializing_if = "is_false")]
    pub pingchange: bool,
    /// The client imported changes in this request.
    #[serde(default, skip_serializing_if = "is_false")]
    pub importedchanges: bool,
    /// Client ids of items added in this request, mapped to server ids.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub clientids: BTreeMap<String, String>,
    /// Item ids the client asked to fetch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fetchids: Vec<String>,
    /// Item ids that must be emitted ahead of other changes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ensure: Vec<String>,
}

impl Collection {
    /// Creates a collection with only an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Creates a collection populated with request defaults.
    pub fn with_defaults(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            windowsize: Some(DEFAULT_WINDOW_SIZE),
            truncation: Some(TRUNCATION_ALL),
            conflict: Some(CONFLICT_OVERWRITE_PIM),
            bodyprefs: Some(BTreeMap::new()),
            mimesupport: Some(MIME_SUPPORT_NONE),
            mimetruncation: Some(TRUNCATION_8),
            ..Self::default()
        }
    }

    /// Sets the class.
    #[must_use]
    pub fn with_class(mut self, class: CollectionClass) -> Self {
        self.class = Some(class);
        self
    }

    /// Sets the backend folder id.
    #[must_use]
    pub fn with_serverid(mut self, serverid: impl Into<String>) -> Self {
        self.serverid = Some(serverid.into());
        self
    }

    /// Sets the synckey.
    #[must_use]
    pub fn with_synckey(mut self, synckey: SyncKey) -> Self {
        self.synckey = Some(synckey);
        self
    }

    /// Sets the window size.
    #[must_use]
    pub fn with_windowsize(mut self, windowsize: u32) -> Self {
        self.windowsize = Some(windowsize);
        self
    }

    /// Sets the filter type.
    #[must_use]
    pub fn with_filtertype(mut self, filtertype: u32) -> Self {
        self.filtertype = Some(filtertype);
        self
    }

    /// Returns true if the collection has no baseline (no key, or `"0"`).
    pub fn needs_full_resync(&self) -> bool {
        self.synckey.as_ref().map_or(true, SyncKey::is_zero)
    }

    /// Returns the effective window size, normalized.
    pub fn effective_window_size(&self) -> u32 {
        normalize_window_size(self.windowsize.unwrap_or(DEFAULT_WINDOW_SIZE))
    }

    /// Returns the truncation to apply when fetching item bodies, if any.
    ///
    /// Body preferences take precedence over the legacy truncation code.
    pub fn body_truncation(&self) -> Option<u32> {
        if let Some(prefs) = &self.bodyprefs {
            if let Some(size) = prefs.values().filter_map(|p| p.truncationsize).min() {
                return Some(size);
            }
        }
        match self.truncation {
            Some(TRUNCATION_ALL) | None => None,
            Some(code) => Some(truncation_bytes(code)),
        }
    }
}

/// Maps a legacy truncation code to a byte count.
fn truncation_bytes(code: u32) -> u32 {
    match code {
        0 => 0,
        1 => 4096,
        2 => 5120,
        3 => 7168,
        4 => 10240,
        5 => 20480,
        6 => 51200,
        7 => 102_400,
        _ => u32::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_size_normalization() {
        assert_eq!(normalize_window_size(0), MAX_WINDOW_SIZE);
        assert_eq!(normalize_window_size(513), MAX_WINDOW_SIZE);
        assert_eq!(normalize_window_size(512), 512);
        assert_eq!(normalize_window_size(1), 1);
        assert_eq!(normalize_window_size(25), 25);
    }

    #[test]
    fn class_names_round_trip() {
        for class in [
            CollectionClass::Email,
            CollectionClass::Contacts,
            CollectionClass::Calendar,
            CollectionClass::Tasks,
            CollectionClass::Notes,
        ] {
            assert_eq!(CollectionClass::parse(class.as_str()).unwrap(), class);
        }
        assert!(CollectionClass::parse("Journal").is_err());
    }

    #[test]
    fn full_resync_detection() {
        assert!(Collection::new("a").needs_full_resync());
        assert!(Collection::new("a")
            .with_synckey(SyncKey::zero())
            .needs_full_resync());
        assert!(!Collection::new("a")
            .with_synckey(SyncKey::new_series())
            .needs_full_resync());
    }

    #[test]
    fn defaults() {
        let c = Collection::with_defaults("f1");
        assert_eq!(c.windowsize, Some(DEFAULT_WINDOW_SIZE));
        assert_eq!(c.truncation, Some(TRUNCATION_ALL));
        assert_eq!(c.conflict, Some(CONFLICT_OVERWRITE_PIM));
        assert_eq!(c.body_truncation(), None);
    }

    #[test]
    fn body_truncation_prefers_bodyprefs() {
        let mut c = Collection::new("f1");
        c.truncation = Some(1);
        assert_eq!(c.body_truncation(), Some(4096));

        let mut prefs = BTreeMap::new();
        prefs.insert(
            "1".to_string(),
            BodyPreference {
                body_type: 1,
                truncationsize: Some(200),
                ..BodyPreference::default()
            },
        );
        c.bodyprefs = Some(prefs);
        assert_eq!(c.body_truncation(), Some(200));
    }

    #[test]
    fn serialization_skips_absent_fields() {
        let c = Collection::new("f1").with_class(CollectionClass::Contacts);
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, r#"{"id":"f1","class":"Contacts"}"#);
    }
}
