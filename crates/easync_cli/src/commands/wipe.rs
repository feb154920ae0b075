//! Wipe command implementation.

use easync_protocol::RemoteWipeStatus;
use easync_state::StateStore;
use tracing::info;

/// Requests a remote wipe of a device, or with `clear` puts it back in
/// good standing. A running PING or looping SYNC of the device ends on its
/// next check once a wipe is pending.
pub fn run(store: &dyn StateStore, device: &str, clear: bool) -> Result<(), Box<dyn std::error::Error>> {
    let status = if clear {
        RemoteWipeStatus::Ok
    } else {
        RemoteWipeStatus::Pending
    };
    store.set_device_rw_status(device, status)?;
    info!(device, status = status.code(), "remote wipe status set");
    println!("{device}: {status:?}");
    Ok(())
}
