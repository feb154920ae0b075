//! Hands accepted changes to a wire encoder.

use crate::backend::BackendItem;
use crate::sync::{ExportItem, ExportOutcome, Exporter};
use easync_protocol::{ChangeFlags, ChangeKind, ChangeRecord, CollectionClass, FlagState};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, warn};

/// One event of a SYNC response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// An item new to the device.
    Add {
        /// Item id.
        id: String,
        /// Fetched item.
        item: BackendItem,
    },
    /// A changed item.
    Modify {
        /// Item id.
        id: String,
        /// Fetched item.
        item: BackendItem,
    },
    /// A removed item.
    Delete {
        /// Item id.
        id: String,
    },
    /// A read flag change of a mail item.
    ReadFlag {
        /// Item id.
        id: String,
        /// New flag state.
        flags: FlagState,
    },
    /// An item moved to another folder.
    Move {
        /// Item id.
        id: String,
        /// Destination folder.
        parent: String,
    },
}

impl StreamEvent {
    /// Returns the item id of the event.
    pub fn id(&self) -> &str {
        match self {
            StreamEvent::Add { id, .. }
            | StreamEvent::Modify { id, .. }
            | StreamEvent::Delete { id }
            | StreamEvent::ReadFlag { id, .. }
            | StreamEvent::Move { id, .. } => id,
        }
    }
}

/// Errors a wire encoder reports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// The response has no room left.
    #[error("response window is full")]
    Full,

    /// The item cannot be represented on the wire.
    #[error("cannot encode {id}: {reason}")]
    Unsupported {
        /// Item id.
        id: String,
        /// Why.
        reason: String,
    },
}

/// Writes response events in wire format.
pub trait WireEncoder {
    /// Encodes one event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event was not written.
    fn encode(&mut self, event: &StreamEvent) -> Result<(), EncodeError>;
}

/// A response entry in envelope form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeEntry {
    /// Event tag: `add`, `modify`, `delete`, `flags` or `move`.
    pub op: String,
    /// Item id.
    pub id: String,
    /// Item payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// True if the payload was truncated.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    /// Read flag state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<FlagState>,
    /// Destination folder of a move.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl From<&StreamEvent> for EnvelopeEntry {
    fn from(event: &StreamEvent) -> Self {
        let mut entry = EnvelopeEntry {
            op: String::new(),
            id: event.id().to_string(),
            body: None,
            truncated: false,
            flags: None,
            parent: None,
        };
        match event {
            StreamEvent::Add { item, .. } | StreamEvent::Modify { item, .. } => {
                entry.op = if matches!(event, StreamEvent::Add { .. }) {
                    "add".into()
                } else {
                    "modify".into()
                };
                entry.body = Some(item.body.clone());
                entry.truncated = item.truncated;
            }
            StreamEvent::Delete { .. } => entry.op = "delete".into(),
            StreamEvent::ReadFlag { flags, .. } => {
                entry.op = "flags".into();
                entry.flags = Some(*flags);
            }
            StreamEvent::Move { parent, .. } => {
                entry.op = "move".into();
                entry.parent = Some(parent.clone());
            }
        }
        entry
    }
}

/// An encoder that collects entries in memory, up to an optional limit.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeBuffer {
    entries: Vec<EnvelopeEntry>,
    limit: Option<usize>,
}

impl EnvelopeBuffer {
    /// Creates an unbounded buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer that accepts at most `limit` entries.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: Vec::new(),
            limit: Some(limit),
        }
    }

    /// Returns the collected entries.
    pub fn entries(&self) -> &[EnvelopeEntry] {
        &self.entries
    }

    /// Returns true if the limit is reached.
    pub fn is_full(&self) -> bool {
        self.limit.map_or(false, |limit| self.entries.len() >= limit)
    }

    /// Consumes the buffer.
    pub fn into_entries(self) -> Vec<EnvelopeEntry> {
        self.entries
    }
}

impl WireEncoder for EnvelopeBuffer {
    fn encode(&mut self, event: &StreamEvent) -> Result<(), EncodeError> {
        if self.is_full() {
            return Err(EncodeError::Full);
        }
        self.entries.push(EnvelopeEntry::from(event));
        Ok(())
    }
}

/// Turns accepted changes into response events.
///
/// A response never carries the same event twice: an `(kind, id)` pair
/// already written is skipped. Read flag changes are only sent for mail.
#[derive(Debug)]
pub struct Streamer<E> {
    encoder: E,
    class: Option<CollectionClass>,
    seen: HashSet<(ChangeKind, String)>,
    written: usize,
}

impl<E: WireEncoder> Streamer<E> {
    /// Creates a streamer for a collection of `class`.
    pub fn new(encoder: E, class: Option<CollectionClass>) -> Self {
        Self {
            encoder,
            class,
            seen: HashSet::new(),
            written: 0,
        }
    }

    /// Returns the encoder.
    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    /// Returns the number of events written.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Consumes the streamer and returns the encoder.
    pub fn into_inner(self) -> E {
        self.encoder
    }

    fn event_for(&self, change: &ChangeRecord, item: Option<&ExportItem>) -> Option<StreamEvent> {
        let id = change.id.clone();
        match change.kind {
            ChangeKind::Change => match item {
                Some(ExportItem::Message(item)) if change.is_add() => Some(StreamEvent::Add {
                    id,
                    item: item.clone(),
                }),
                Some(ExportItem::Message(item)) => Some(StreamEvent::Modify {
                    id,
                    item: item.clone(),
                }),
                _ => None,
            },
            ChangeKind::Delete => Some(StreamEvent::Delete { id }),
            ChangeKind::Flags => {
                let supported = self.class.map_or(false, |c| c.supports_flag_changes());
                match change.flags {
                    Some(ChangeFlags::State(flags)) if supported => {
                        Some(StreamEvent::ReadFlag { id, flags })
                    }
                    _ => None,
                }
            }
            ChangeKind::Move => Some(StreamEvent::Move {
                id,
                parent: change.parent.clone().unwrap_or_default(),
            }),
        }
    }
}

impl<E: WireEncoder> Exporter for Streamer<E> {
    fn export(&mut self, change: &ChangeRecord, item: Option<&ExportItem>) -> ExportOutcome {
        let key = (change.kind, change.id.clone());
        if self.seen.contains(&key) {
            debug!(id = %change.id, kind = change.kind.as_str(), "duplicate change skipped");
            return ExportOutcome::Skipped;
        }
        let Some(event) = self.event_for(change, item) else {
            return ExportOutcome::Skipped;
        };
        match self.encoder.encode(&event) {
            Ok(()) => {
                self.seen.insert(key);
                self.written += 1;
                ExportOutcome::Written
            }
            Err(EncodeError::Full) => ExportOutcome::Rejected,
            Err(err) => {
                warn!(id = %change.id, error = %err, "change not encoded");
                ExportOutcome::Rejected
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> ExportItem {
        ExportItem::Message(BackendItem {
            id: id.into(),
            body: format!("body of {id}"),
            truncated: false,
        })
    }

    #[test]
    fn adds_and_modifies() {
        let mut streamer = Streamer::new(EnvelopeBuffer::new(), Some(CollectionClass::Contacts));
        assert_eq!(
            streamer.export(&ChangeRecord::add("a"), Some(&item("a"))),
            ExportOutcome::Written
        );
        assert_eq!(
            streamer.export(&ChangeRecord::modify("b"), Some(&item("b"))),
            ExportOutcome::Written
        );
        let entries = streamer.into_inner().into_entries();
        assert_eq!(entries[0].op, "add");
        assert_eq!(entries[1].op, "modify");
        assert_eq!(entries[1].body.as_deref(), Some("body of b"));
    }

    #[test]
    fn duplicates_are_skipped() {
        let mut streamer = Streamer::new(EnvelopeBuffer::new(), Some(CollectionClass::Email));
        assert_eq!(
            streamer.export(&ChangeRecord::delete("a"), None),
            ExportOutcome::Written
        );
        assert_eq!(
            streamer.export(&ChangeRecord::delete("a"), None),
            ExportOutcome::Skipped
        );
        assert_eq!(streamer.written(), 1);
        assert_eq!(streamer.encoder().entries().len(), 1);
    }

    #[test]
    fn flags_only_for_mail() {
        let read = FlagState {
            read: true,
            flagged: false,
        };
        let mut contacts = Streamer::new(EnvelopeBuffer::new(), Some(CollectionClass::Contacts));
        assert_eq!(
            contacts.export(&ChangeRecord::flags("a", read), None),
            ExportOutcome::Skipped
        );
        let mut mail = Streamer::new(EnvelopeBuffer::new(), Some(CollectionClass::Email));
        assert_eq!(
            mail.export(&ChangeRecord::flags("a", read), None),
            ExportOutcome::Written
        );
        assert_eq!(mail.encoder().entries()[0].flags, Some(read));
    }

    #[test]
    fn full_buffer_rejects_and_allows_retry() {
        let mut streamer = Streamer::new(EnvelopeBuffer::with_limit(1), None);
        assert_eq!(
            streamer.export(&ChangeRecord::delete("a"), None),
            ExportOutcome::Written
        );
        assert_eq!(
            streamer.export(&ChangeRecord::delete("b"), None),
            ExportOutcome::Rejected
        );
        assert!(streamer.encoder().is_full());
    }

    #[test]
    fn envelope_serialization_omits_empty_fields() {
        let entry = EnvelopeEntry::from(&StreamEvent::Move {
            id: "m1".into(),
            parent: "archive".into(),
        });
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"op":"move","id":"m1","parent":"archive"}"#);
    }
}
