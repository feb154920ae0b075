//! Change records and the baseline diff that produces them.

use serde::{Deserialize, Serialize};

/// The kind of a backend change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Item added or modified.
    Change,
    /// Item removed.
    Delete,
    /// Only the read/flag state changed (mail only).
    Flags,
    /// Item moved to another folder.
    Move,
}

impl ChangeKind {
    /// Returns the lowercase tag of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Change => "change",
            ChangeKind::Delete => "delete",
            ChangeKind::Flags => "flags",
            ChangeKind::Move => "move",
        }
    }
}

/// Read and follow-up flag state of a mail item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlagState {
    /// Message has been read.
    pub read: bool,
    /// Message is flagged for follow-up.
    pub flagged: bool,
}

/// Flags attached to a change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeFlags {
    /// The item is new to the device; a `Change` carrying this is an add.
    NewMessage,
    /// The new flag state of the item.
    State(FlagState),
}

/// A single backend change, consumed exactly once by the diff driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// The kind of change.
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    /// Backend item id.
    pub id: String,
    /// Flags, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<ChangeFlags>,
    /// Parent folder (destination folder for moves).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl ChangeRecord {
    /// Creates an add.
    pub fn add(id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Change,
            id: id.into(),
            flags: Some(ChangeFlags::NewMessage),
            parent: None,
        }
    }

    /// Creates a modification.
    pub fn modify(id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Change,
            id: id.into(),
            flags: None,
            parent: None,
        }
    }

    /// Creates a deletion.
    pub fn delete(id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Delete,
            id: id.into(),
            flags: None,
            parent: None,
        }
    }

    /// Creates a flag-only change.
    pub fn flags(id: impl Into<String>, state: FlagState) -> Self {
        Self {
            kind: ChangeKind::Flags,
            id: id.into(),
            flags: Some(ChangeFlags::State(state)),
            parent: None,
        }
    }

    /// Creates a move into `parent`.
    pub fn moved(id: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Move,
            id: id.into(),
            flags: None,
            parent: Some(parent.into()),
        }
    }

    /// Sets the parent folder.
    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Returns true if this change introduces an item the device lacks.
    pub fn is_add(&self) -> bool {
        self.kind == ChangeKind::Change && self.flags == Some(ChangeFlags::NewMessage)
    }
}

/// A version stamp of one item, as remembered in a baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStat {
    /// Item (or folder) id.
    pub id: String,
    /// Opaque modification token; differs whenever the item changed.
    #[serde(rename = "mod")]
    pub mod_token: String,
    /// Mail flag state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<FlagState>,
    /// Parent folder, used by folder baselines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl ItemStat {
    /// Creates a stat with no flags or parent.
    pub fn new(id: impl Into<String>, mod_token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mod_token: mod_token.into(),
            flags: None,
            parent: None,
        }
    }

    /// Sets the flag state.
    #[must_use]
    pub fn with_flags(mut self, flags: FlagState) -> Self {
        self.flags = Some(flags);
        self
    }

    /// Sets the parent.
    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }
}

/// Computes the changes that turn baseline `old` into `new`.
///
/// Both inputs are ordered by id, descending, and merged. An item present
/// in both yields a `Flags` change when its flag state differs and a
/// `Change` when its mod token differs (both may be emitted). Items only in
/// `new` become adds; items only in `old` become deletes.
pub fn diff_states(old: &[ItemStat], new: &[ItemStat]) -> Vec<ChangeRecord> {
    let mut old: Vec<&ItemStat> = old.iter().collect();
    let mut new: Vec<&ItemStat> = new.iter().collect();
    old.sort_by(|a, b| b.id.cmp(&a.id));
    new.sort_by(|a, b| b.id.cmp(&a.id));

    let mut changes = Vec::new();
    let (mut io, mut inew) = (0, 0);

    while io < old.len() && inew < new.len() {
        let (o, n) = (old[io], new[inew]);
        if o.id == n.id {
            if let (Some(of), Some(nf)) = (o.flags, n.flags) {
                if of != nf {
                    changes.push(ChangeRecord::flags(n.id.clone(), nf));
                }
            }
            if o.mod_token != n.mod_token {
                changes.push(ChangeRecord::modify(n.id.clone()));
            }
            io += 1;
            inew += 1;
        } else if o.id > n.id {
            changes.push(ChangeRecord::delete(o.id.clone()));
            io += 1;
        } else {
            changes.push(ChangeRecord::add(n.id.clone()));
            inew += 1;
        }
    }

    changes.extend(old[io..].iter().map(|o| ChangeRecord::delete(o.id.clone())));
    changes.extend(new[inew..].iter().map(|n| ChangeRecord::add(n.id.clone())));
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn add_vs_modify() {
        assert!(ChangeRecord::add("1").is_add());
        assert!(!ChangeRecord::modify("1").is_add());
        assert!(!ChangeRecord::delete("1").is_add());
    }

    #[test]
    fn diff_detects_each_kind() {
        let read = FlagState {
            read: true,
            flagged: false,
        };
        let old = vec![
            ItemStat::new("a", "1"),
            ItemStat::new("b", "1").with_flags(FlagState::default()),
            ItemStat::new("c", "1"),
        ];
        let new = vec![
            ItemStat::new("a", "2"),
            ItemStat::new("b", "1").with_flags(read),
            ItemStat::new("d", "1"),
        ];

        let changes = diff_states(&old, &new);
        assert_eq!(
            changes,
            vec![
                ChangeRecord::add("d"),
                ChangeRecord::delete("c"),
                ChangeRecord::flags("b", read),
                ChangeRecord::modify("a"),
            ]
        );
    }

    #[test]
    fn diff_of_identical_states_is_empty() {
        let state = vec![ItemStat::new("x", "7"), ItemStat::new("y", "3")];
        assert!(diff_states(&state, &state).is_empty());
    }

    #[test]
    fn serde_shape() {
        let json = serde_json::to_value(ChangeRecord::add("42")).unwrap();
        assert_eq!(json["type"], "change");
        assert_eq!(json["flags"], "new_message");
    }

    fn stats() -> impl Strategy<Value = Vec<ItemStat>> {
        prop::collection::btree_map("[a-f]{1,3}", 0u8..4, 0..12).prop_map(|m| {
            m.into_iter()
                .map(|(id, v)| ItemStat::new(id, v.to_string()))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn applying_diff_reaches_new_ids(old in stats(), new in stats()) {
            let changes = diff_states(&old, &new);
            let mut ids: std::collections::BTreeSet<String> =
                old.iter().map(|s| s.id.clone()).collect();
            for change in &changes {
                match change.kind {
                    ChangeKind::Delete => { ids.remove(&change.id); }
                    ChangeKind::Change if change.is_add() => { ids.insert(change.id.clone()); }
                    _ => {}
                }
            }
            let expected: std::collections::BTreeSet<String> =
                new.iter().map(|s| s.id.clone()).collect();
            prop_assert_eq!(ids, expected);
        }
    }
}
