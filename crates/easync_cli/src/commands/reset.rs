//! Reset command implementation.

use easync_protocol::SyncKey;
use easync_state::{DirtySet, StateStore};
use tracing::info;

/// Forces a collection to resynchronize.
///
/// The cached key becomes `"0"` and every stored state of the collection
/// is removed, so the device's next SYNC fails with an invalid synckey and
/// restarts. With `purge` the collection is forgotten entirely.
///
/// Returns false if the collection is not cached.
pub fn run(
    store: &dyn StateStore,
    device: &str,
    user: &str,
    collection: &str,
    purge: bool,
) -> Result<bool, Box<dyn std::error::Error>> {
    let mut record = store.get_sync_cache(device, user, None)?;
    let mut dirty = DirtySet::new();
    if purge {
        if record.collections.remove(collection).is_none() {
            return Ok(false);
        }
        dirty.mark_removed(collection);
    } else {
        let Some(cached) = record.collections.get_mut(collection) else {
            return Ok(false);
        };
        cached.synckey = Some(SyncKey::zero());
        cached.lastsynckey = None;
        dirty.mark_collection(collection);
    }
    store.save_sync_cache(&record, device, user, &dirty)?;
    store.remove_collection_state(device, user, collection, None)?;
    info!(device, user, collection, purge, "collection reset");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use easync_protocol::Collection;
    use easync_state::{CollectionState, FileStateStore, SyncCacheRecord};
    use tempfile::TempDir;

    fn seeded() -> (TempDir, FileStateStore, SyncKey) {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::open(dir.path()).unwrap();
        let key = SyncKey::new_series();
        let mut record = SyncCacheRecord::default();
        let mut collection = Collection::new("F1");
        collection.lastsynckey = Some(key.clone());
        record.collections.insert("F1".into(), collection);
        store
            .save_sync_cache(&record, "dev1", "alice", &DirtySet::everything(record.collections.keys()))
            .unwrap();
        store
            .save_collection_state("dev1", "alice", &CollectionState::new("F1", key.clone()))
            .unwrap();
        (dir, store, key)
    }

    #[test]
    fn reset_zeroes_key_and_drops_states() {
        let (_dir, store, key) = seeded();
        assert!(run(&store, "dev1", "alice", "F1", false).unwrap());

        let record = store.get_sync_cache("dev1", "alice", None).unwrap();
        let cached = &record.collections["F1"];
        assert!(cached.synckey.as_ref().unwrap().is_zero());
        assert!(cached.lastsynckey.is_none());
        assert!(store.load_collection_state("dev1", "alice", "F1", &key).is_err());
    }

    #[test]
    fn purge_forgets_collection() {
        let (_dir, store, _key) = seeded();
        assert!(run(&store, "dev1", "alice", "F1", true).unwrap());
        let record = store.get_sync_cache("dev1", "alice", None).unwrap();
        assert!(record.collections.is_empty());
        assert!(!run(&store, "dev1", "alice", "F1", true).unwrap());
    }
}
