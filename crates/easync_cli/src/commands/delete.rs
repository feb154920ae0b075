//! Delete command implementation.

use easync_state::StateStore;
use tracing::info;

/// Deletes a device's sync cache, collection states and folder cache.
pub fn run(store: &dyn StateStore, device: &str, user: &str) -> Result<(), Box<dyn std::error::Error>> {
    store.delete_sync_cache(device, user)?;
    info!(device, user, "sync cache deleted");
    println!("Deleted sync state of {device} for {user}");
    Ok(())
}
