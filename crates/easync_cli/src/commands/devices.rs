//! Devices command implementation.

use easync_protocol::RemoteWipeStatus;
use easync_state::StateStore;
use serde::Serialize;
use std::collections::BTreeMap;

/// A device and the users it synchronizes.
#[derive(Debug, Serialize)]
pub struct DeviceEntry {
    /// Device id.
    pub device: String,
    /// Users with a sync cache on this device.
    pub users: Vec<String>,
    /// Remote wipe status.
    pub rw_status: RemoteWipeStatus,
}

/// Lists every device with at least one sync cache.
pub fn list(store: &dyn StateStore) -> Result<Vec<DeviceEntry>, Box<dyn std::error::Error>> {
    let mut users: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (device, user) in store.list_sync_caches()? {
        users.entry(device).or_default().push(user);
    }
    let mut devices = Vec::new();
    for (device, mut users) in users {
        users.sort();
        let rw_status = store.device_rw_status(&device)?;
        devices.push(DeviceEntry {
            device,
            users,
            rw_status,
        });
    }
    Ok(devices)
}

/// Runs the devices command.
pub fn run(store: &dyn StateStore, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let devices = list(store)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&devices)?),
        _ => {
            if devices.is_empty() {
                println!("No devices.");
            }
            for entry in &devices {
                println!(
                    "{}  users={}  wipe={:?}",
                    entry.device,
                    entry.users.join(","),
                    entry.rw_status
                );
            }
        }
    }
    Ok(())
}
