//! The long poll behind PING and looping SYNC.

use super::Collections;
use crate::error::{CollectionError, EngineError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Options for [`Collections::poll_for_changes`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOptions {
    /// Only watch collections flagged pingable.
    pub pingable: bool,
}

impl PollOptions {
    /// Watches pingable collections only.
    pub fn pingable() -> Self {
        Self { pingable: true }
    }
}

impl Collections {
    /// Waits up to `heartbeat` seconds for changes in the working set,
    /// checking every `interval` seconds.
    ///
    /// On entry the start of the heartbeat is written to the cache. Any
    /// later request for the same device writes its own start, and this
    /// loop notices on its next check and gives up with
    /// [`CollectionError::Stale`]: at most one long poll per device runs to
    /// completion. Collections with changes get their getchanges flag set.
    ///
    /// Returns whether changes were found.
    ///
    /// # Errors
    ///
    /// - `Server` if no collection can be watched or state cannot be read
    /// - `Stale` if another request took over the session
    /// - `FolderSyncRequired` if a folder vanished or a remote wipe is pending
    pub fn poll_for_changes(
        &mut self,
        heartbeat: u64,
        interval: u64,
        options: PollOptions,
    ) -> Result<bool, CollectionError> {
        if options.pingable && !self.collections.keys().any(|id| self.cache.is_pingable(id)) {
            error!("ping requested but no collection is pingable");
            return Err(CollectionError::Server);
        }

        let clock = std::sync::Arc::clone(&self.ctx.clock);
        let started = clock.now();
        let until = started + heartbeat as i64;
        let mut interval = interval.max(1) as i64;
        let mut data_available = false;

        debug!(heartbeat, "waiting for changes");
        self.cache.set_lasthbsyncstarted(Some(started));
        self.save().map_err(|err| {
            error!(error = %err, "cannot record heartbeat start");
            CollectionError::Server
        })?;

        loop {
            let now = clock.now();
            if now >= until {
                break;
            }
            if until - now < interval {
                interval = until - now;
            }

            if self.is_stale()? {
                return Err(CollectionError::Stale);
            }
            if self.collections.is_empty() {
                error!("no collections to poll");
                return Err(CollectionError::Server);
            }
            match self.ctx.remote_wipe_pending() {
                Ok(false) => {}
                Ok(true) => {
                    info!(device = %self.ctx.device.id, "remote wipe pending, ending poll");
                    return Err(CollectionError::FolderSyncRequired);
                }
                Err(err) => {
                    error!(error = %err, "cannot read remote wipe status");
                    return Err(CollectionError::Server);
                }
            }

            self.clear_changes();
            for id in self.ids() {
                if self.check_collection(&id, options)? {
                    data_available = true;
                }
            }

            if data_available {
                debug!("found changes");
                break;
            }

            debug!(seconds = interval, "sleeping");
            clock.sleep(Duration::from_secs(interval as u64));

            if let Err(err) = self.update_collections_from_cache() {
                warn!(error = %err, "cannot refresh collections from cache");
            }
        }

        if self.is_stale()? {
            debug!("cache changed during the poll, leaving the export to the newer request");
            return Err(CollectionError::Stale);
        }
        debug!(
            data_available,
            imported_changes = self.imported_changes,
            "looping sync complete"
        );
        Ok(data_available)
    }

    fn is_stale(&self) -> Result<bool, CollectionError> {
        self.check_stale_request().map_err(|err| {
            error!(error = %err, "cannot validate sync cache");
            CollectionError::Server
        })
    }

    /// Checks one collection for changes; returns true if it has some.
    fn check_collection(
        &mut self,
        id: &str,
        options: PollOptions,
    ) -> Result<bool, CollectionError> {
        if options.pingable && !self.cache.is_pingable(id) {
            debug!(collection = %id, "skipping collection that is not pingable");
            return Ok(false);
        }
        let Some(collection) = self.collections.get(id).cloned() else {
            return Ok(false);
        };

        let state = match self.init_collection_state(&collection) {
            Ok(state) => state,
            Err(EngineError::StateGone { .. }) => {
                warn!(collection = %id, "state not found, flagging for resync");
                self.flag_changes(id);
                return Ok(true);
            }
            Err(EngineError::InvalidRequest(reason)) => {
                debug!(collection = %id, %reason, "collection not synchronized yet, skipping");
                return Ok(false);
            }
            Err(err) => {
                error!(collection = %id, error = %err, "cannot load collection state");
                return Err(CollectionError::Server);
            }
        };

        match self.get_collection_changes(id, &state, true, &[]) {
            Ok(changes) if changes.is_empty() => Ok(false),
            Ok(_) => {
                self.flag_changes(id);
                Ok(true)
            }
            Err(EngineError::StaleState(_)) => {
                error!(collection = %id, "stale backend state, force-clearing device state");
                if let Err(err) = self.ctx.store.remove_collection_state(
                    &self.ctx.device.id,
                    &self.ctx.device.user,
                    id,
                    None,
                ) {
                    error!(collection = %id, error = %err, "cannot clear collection state");
                    return Err(CollectionError::Server);
                }
                self.flag_changes(id);
                Ok(true)
            }
            Err(EngineError::FolderGone(folder)) => {
                error!(collection = %id, %folder, "folder gone, hierarchy sync required");
                Err(CollectionError::FolderSyncRequired)
            }
            Err(err) => {
                let backoff = self.ctx.config.backend_backoff;
                warn!(
                    collection = %id,
                    error = %err,
                    backoff_secs = backoff.as_secs(),
                    "backend error, throttling"
                );
                self.ctx.clock.sleep(backoff);
                Ok(false)
            }
        }
    }

    fn flag_changes(&mut self, id: &str) {
        if let Some(collection) = self.collections.get_mut(id) {
            collection.getchanges = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::clock::{Clock, ManualClock};
    use crate::error::BackendError;
    use crate::session::{Device, SessionContext};
    use crate::sync_cache::{SyncCache, UpdateOptions};
    use crate::config::EngineConfig;
    use easync_protocol::{Collection, FolderEntry, ProvisioningMode, RemoteWipeStatus, SyncKey, FOLDER_TYPE_CONTACT};
    use easync_state::{CollectionState, InMemoryStateStore, StateStore};
    use std::sync::Arc;

    struct Fixture {
        store: Arc<InMemoryStateStore>,
        backend: Arc<MemoryBackend>,
        clock: Arc<ManualClock>,
        ctx: SessionContext,
        key: SyncKey,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStateStore::new());
        let backend = Arc::new(MemoryBackend::new());
        backend.add_folder(FolderEntry::new("contacts", "Contacts", FOLDER_TYPE_CONTACT));
        let clock = Arc::new(ManualClock::new(0));
        let ctx = SessionContext::new(
            Device::new("dev1", "alice"),
            Arc::clone(&store) as Arc<dyn StateStore>,
            Arc::clone(&backend) as Arc<dyn crate::backend::Backend>,
        )
        .with_clock(Arc::clone(&clock) as Arc<dyn crate::clock::Clock>);

        let key = SyncKey::new_series();
        store
            .save_collection_state("dev1", "alice", &CollectionState::new("F1", key.clone()))
            .unwrap();
        let mut cache = SyncCache::new(&ctx).unwrap();
        cache.update_collection(
            &Collection::new("F1")
                .with_serverid("contacts")
                .with_synckey(key.clone()),
            UpdateOptions::default(),
        );
        cache.save().unwrap();

        Fixture {
            store,
            backend,
            clock,
            ctx,
            key,
        }
    }

    fn collections(fx: &Fixture) -> Collections {
        let mut collections = Collections::new(fx.ctx.clone()).unwrap();
        collections.load_collections_from_cache().unwrap();
        collections
    }

    #[test]
    fn times_out_without_changes() {
        let fx = fixture();
        let mut collections = collections(&fx);
        let found = collections
            .poll_for_changes(10, 3, PollOptions::default())
            .unwrap();
        assert!(!found);
        assert_eq!(
            fx.clock.sleeps(),
            [3, 3, 3, 1].map(Duration::from_secs).to_vec()
        );
        assert_eq!(fx.clock.now(), 10);
        assert_eq!(fx.backend.calls(), 4);
    }

    #[test]
    fn changes_end_the_poll() {
        let fx = fixture();
        fx.backend.put_item("contacts", "c1", "Jane").unwrap();
        let mut collections = collections(&fx);
        assert!(collections
            .poll_for_changes(10, 3, PollOptions::default())
            .unwrap());
        assert!(fx.clock.sleeps().is_empty());
        assert!(collections.get_changes_flag("F1").unwrap());
    }

    #[test]
    fn pingable_required() {
        let fx = fixture();
        let mut collections = collections(&fx);
        assert_eq!(
            collections.poll_for_changes(10, 3, PollOptions::pingable()),
            Err(CollectionError::Server)
        );

        collections.cache_mut().set_pingable("F1").unwrap();
        assert_eq!(
            collections.poll_for_changes(10, 3, PollOptions::pingable()),
            Ok(false)
        );
    }

    #[test]
    fn missing_state_counts_as_data() {
        let fx = fixture();
        fx.store
            .remove_collection_state("dev1", "alice", "F1", None)
            .unwrap();
        let mut collections = collections(&fx);
        assert_eq!(
            collections.poll_for_changes(10, 3, PollOptions::default()),
            Ok(true)
        );
        assert!(collections.get_changes_flag("F1").unwrap());
        assert_eq!(fx.backend.calls(), 0);
    }

    #[test]
    fn stale_backend_state_is_cleared() {
        let fx = fixture();
        fx.backend
            .fail_folder("contacts", BackendError::StaleState("contacts".into()));
        let mut collections = collections(&fx);
        assert_eq!(
            collections.poll_for_changes(10, 3, PollOptions::default()),
            Ok(true)
        );
        assert!(fx
            .store
            .read_collection_state("dev1", "alice", "F1", &fx.key)
            .unwrap()
            .is_none());
    }

    #[test]
    fn vanished_folder_requires_folder_sync() {
        let fx = fixture();
        fx.backend
            .fail_folder("contacts", BackendError::FolderGone("contacts".into()));
        let mut collections = collections(&fx);
        assert_eq!(
            collections.poll_for_changes(10, 3, PollOptions::default()),
            Err(CollectionError::FolderSyncRequired)
        );
    }

    #[test]
    fn backend_errors_back_off() {
        let fx = fixture();
        fx.backend
            .fail_folder("contacts", BackendError::Unavailable("down".into()));
        let ctx = fx.ctx.clone().with_config(
            EngineConfig::new().with_backend_backoff(Duration::from_secs(4)),
        );
        let mut collections = Collections::new(ctx).unwrap();
        collections.load_collections_from_cache().unwrap();
        assert_eq!(
            collections.poll_for_changes(10, 3, PollOptions::default()),
            Ok(false)
        );
        assert_eq!(
            fx.clock.sleeps(),
            [4, 3, 4, 3].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn pending_wipe_interrupts() {
        let fx = fixture();
        fx.store
            .set_device_rw_status("dev1", RemoteWipeStatus::Pending)
            .unwrap();
        let ctx = fx
            .ctx
            .clone()
            .with_config(EngineConfig::new().with_provisioning(ProvisioningMode::Enforced));
        let mut collections = Collections::new(ctx).unwrap();
        collections.load_collections_from_cache().unwrap();
        assert_eq!(
            collections.poll_for_changes(10, 3, PollOptions::default()),
            Err(CollectionError::FolderSyncRequired)
        );
    }

    #[test]
    fn empty_working_set_is_a_server_error() {
        let fx = fixture();
        let mut collections = Collections::new(fx.ctx.clone()).unwrap();
        assert_eq!(
            collections.poll_for_changes(10, 3, PollOptions::default()),
            Err(CollectionError::Server)
        );
    }

    #[test]
    fn records_heartbeat_start() {
        let fx = fixture();
        fx.clock.set(500);
        let mut collections = collections(&fx);
        collections
            .poll_for_changes(2, 3, PollOptions::default())
            .unwrap();
        let stored = fx.store.get_sync_cache("dev1", "alice", None).unwrap();
        assert_eq!(stored.lasthbsyncstarted, Some(500));
    }
}
