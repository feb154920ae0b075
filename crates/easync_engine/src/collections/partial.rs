//! PARTIAL sync reconciliation.

use super::Collections;
use crate::error::EngineResult;
use easync_protocol::Collection;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;

/// Keys that differ between requests without changing what a collection
/// asks for.
const VOLATILE_KEYS: &[&str] = &[
    "id",
    "serverid",
    "class",
    "synckey",
    "lastsynckey",
    "newsynckey",
    "clientids",
    "fetchids",
    "getchanges",
    "ensure",
    "pingable",
    "pingchange",
    "importedchanges",
];

/// Returns the comparable form of a collection's options.
///
/// Volatile keys and nulls are removed at every level; object keys are
/// ordered, so equal options always produce equal values.
pub fn normalized_snapshot(collection: &Collection) -> Value {
    let mut value = serde_json::to_value(collection).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        for key in VOLATILE_KEYS {
            map.remove(*key);
        }
    }
    strip_nulls(value)
}

fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

/// Returns the SHA-256 digest (hex) of a collection's normalized snapshot.
pub fn collection_digest(collection: &Collection) -> String {
    let snapshot = normalized_snapshot(collection);
    let mut hasher = Sha256::new();
    hasher.update(snapshot.to_string().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

impl Collections {
    /// Reconciles a PARTIAL sync with the cache.
    ///
    /// Every collection the client sent is compared with its cached copy;
    /// the cached collections it did not send are kept aside for
    /// [`Collections::get_missing_collections_from_cache`]. Synckeys the
    /// client confirms are removed from the pending confirmations.
    ///
    /// Returns false if a full SYNC is required: a confirmation is still
    /// outstanding, nothing changed and there is no interval to wait for,
    /// or the last looping sync did not end cleanly.
    ///
    /// # Errors
    ///
    /// Returns an error only if the cache cannot be read.
    pub fn init_partial_sync(&mut self) -> EngineResult<bool> {
        let snapshot: BTreeMap<String, Collection> = self
            .cache
            .collections(true)
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        self.unchanged_count = 0;
        self.synckey_count = 0;
        self.confirmed_count = 0;

        let mut remaining = snapshot.clone();
        for (id, collection) in &self.collections {
            if let Some(cached) = snapshot.get(id) {
                if collection_digest(collection) == collection_digest(cached) {
                    self.unchanged_count += 1;
                }
            }
            remaining.remove(id);

            if let Some(synckey) = &collection.synckey {
                if self.cache.has_confirmed_key(synckey) {
                    debug!(collection = %id, %synckey, "removing confirmed synckey");
                    self.cache.remove_confirmed_key(synckey);
                    self.confirmed_count += 1;
                }
                self.synckey_count += 1;
            }
        }
        self.remaining = remaining;

        if !self.cache.confirmed_synckeys().is_empty() {
            debug!(
                outstanding = self.cache.confirmed_synckeys().len(),
                "unconfirmed synckeys remain, full sync required"
            );
            return Ok(false);
        }
        if self.have_no_changes_in_partial_sync() {
            debug!("partial sync without changes or interval, full sync required");
            return Ok(false);
        }
        if !self.cache.validate_timestamps() {
            debug!("timestamp validation failed, full sync required");
            return Ok(false);
        }
        Ok(true)
    }

    /// Returns how many sent collections matched their cached copy.
    pub fn unchanged_count(&self) -> usize {
        self.unchanged_count
    }

    /// Returns how many sent collections carried a synckey.
    pub fn synckey_count(&self) -> usize {
        self.synckey_count
    }

    /// Returns how many sent synckeys confirmed a pending one.
    pub fn confirmed_count(&self) -> usize {
        self.confirmed_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::clock::ManualClock;
    use crate::session::{Device, SessionContext};
    use crate::sync_cache::{SyncCache, UpdateOptions};
    use easync_protocol::{BodyPreference, SyncKey};
    use easync_state::InMemoryStateStore;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn context() -> SessionContext {
        SessionContext::new(
            Device::new("dev1", "alice"),
            Arc::new(InMemoryStateStore::new()),
            Arc::new(MemoryBackend::new()),
        )
        .with_clock(Arc::new(ManualClock::new(1_000)))
    }

    fn cached(id: &str) -> Collection {
        Collection::new(id)
            .with_windowsize(50)
            .with_filtertype(3)
            .with_synckey(SyncKey::new_series())
    }

    fn seed(ctx: &SessionContext, collections: &[Collection], wait: Option<u64>) {
        let mut cache = SyncCache::new(ctx).unwrap();
        for c in collections {
            cache.update_collection(c, UpdateOptions::default());
        }
        cache.set_wait(wait);
        cache.save().unwrap();
    }

    #[test]
    fn snapshot_ignores_volatile_fields() {
        let mut a = cached("F1");
        let mut b = cached("F1");
        b.synckey = Some(SyncKey::new_series());
        b.getchanges = true;
        b.fetchids = vec!["x".into()];
        b.serverid = Some("inbox".into());
        assert_eq!(collection_digest(&a), collection_digest(&b));

        a.windowsize = Some(10);
        assert_ne!(collection_digest(&a), collection_digest(&b));
    }

    #[test]
    fn snapshot_strips_nested_nulls() {
        let mut prefs = BTreeMap::new();
        prefs.insert(
            "2".to_string(),
            BodyPreference {
                body_type: 2,
                truncationsize: Some(1024),
                ..BodyPreference::default()
            },
        );
        let mut c = Collection::new("F1");
        c.bodyprefs = Some(prefs);
        let snapshot = normalized_snapshot(&c);
        let text = snapshot.to_string();
        assert!(!text.contains("null"));
        assert!(text.contains("truncationsize"));
    }

    #[test]
    fn unchanged_partial_without_interval_requires_full_sync() {
        let ctx = context();
        let (a, b) = (cached("F1"), cached("F2"));
        seed(&ctx, &[a.clone(), b.clone()], None);

        let mut collections = Collections::new(ctx).unwrap();
        collections.add_collection(a, false).unwrap();
        collections.add_collection(b, false).unwrap();
        assert!(!collections.init_partial_sync().unwrap());
        assert_eq!(collections.unchanged_count(), 2);
        assert_eq!(collections.synckey_count(), 2);
    }

    #[test]
    fn unchanged_partial_with_wait_proceeds() {
        let ctx = context();
        let (a, b) = (cached("F1"), cached("F2"));
        seed(&ctx, &[a.clone(), b.clone()], Some(5));

        let mut collections = Collections::new(ctx).unwrap();
        collections.add_collection(a, false).unwrap();
        collections.add_collection(b, false).unwrap();
        assert!(collections.init_partial_sync().unwrap());
    }

    #[test]
    fn outstanding_confirmation_requires_full_sync() {
        let ctx = context();
        let a = cached("F1");
        seed(&ctx, &[a.clone()], Some(5));

        let mut collections = Collections::new(ctx).unwrap();
        collections.cache_mut().add_confirmed_key(SyncKey::new_series());
        collections.add_collection(a, false).unwrap();
        assert!(!collections.init_partial_sync().unwrap());
    }

    #[test]
    fn confirmed_keys_are_consumed() {
        let ctx = context();
        let a = cached("F1");
        seed(&ctx, &[a.clone()], None);

        let mut collections = Collections::new(ctx).unwrap();
        let key = a.synckey.clone().unwrap();
        collections.cache_mut().add_confirmed_key(key);
        collections.add_collection(a, false).unwrap();
        assert!(collections.init_partial_sync().unwrap());
        assert_eq!(collections.confirmed_count(), 1);
        assert!(collections.cache().confirmed_synckeys().is_empty());
    }

    #[test]
    fn unsent_collections_come_from_cache() {
        let ctx = context();
        let (a, b) = (cached("F1"), cached("F2"));
        seed(&ctx, &[a.clone(), b], None);

        let mut collections = Collections::new(ctx).unwrap();
        collections.set_default_window_size(7);
        collections
            .add_collection(a.with_windowsize(25), false)
            .unwrap();
        assert!(collections.init_partial_sync().unwrap());
        collections.get_missing_collections_from_cache();

        assert_eq!(collections.collection_count(), 2);
        let f2 = collections.collection("F2").unwrap();
        assert_eq!(f2.windowsize, Some(7));
        assert!(f2.synckey.is_some());
    }

    #[test]
    fn unfinished_looping_sync_requires_full_sync() {
        let ctx = context();
        let a = cached("F1");
        seed(&ctx, &[a.clone()], Some(5));

        let mut collections = Collections::new(ctx).unwrap();
        collections.cache_mut().set_lasthbsyncstarted(Some(900));
        collections.add_collection(a, false).unwrap();
        assert!(!collections.init_partial_sync().unwrap());
    }

    proptest! {
        #[test]
        fn snapshot_is_stable_under_reserialization(
            windowsize in proptest::option::of(0u32..1000),
            filtertype in proptest::option::of(0u32..9),
            truncation in proptest::option::of(0u32..10),
            conflict in proptest::option::of(0u32..2),
            pref_sizes in proptest::collection::btree_map(1u32..5, proptest::option::of(0u32..100_000), 0..4),
        ) {
            let mut c = Collection::new("F1");
            c.windowsize = windowsize;
            c.filtertype = filtertype;
            c.truncation = truncation;
            c.conflict = conflict;
            if !pref_sizes.is_empty() {
                c.bodyprefs = Some(
                    pref_sizes
                        .into_iter()
                        .map(|(t, size)| (t.to_string(), BodyPreference {
                            body_type: t,
                            truncationsize: size,
                            ..BodyPreference::default()
                        }))
                        .collect(),
                );
            }

            let snapshot = normalized_snapshot(&c);
            let text = snapshot.to_string();
            let reparsed: Value = serde_json::from_str(&text).unwrap();
            prop_assert_eq!(&reparsed, &snapshot);
            prop_assert_eq!(reparsed.to_string(), text);

            let round_trip: Collection = serde_json::from_str(&serde_json::to_string(&c).unwrap()).unwrap();
            prop_assert_eq!(collection_digest(&round_trip), collection_digest(&c));
        }
    }
}
