//! Inspect command implementation.

use easync_state::{StateStore, SyncCacheRecord};
use serde::Serialize;

/// Sync cache inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Device id.
    pub device: String,
    /// User name.
    pub user: String,
    /// Hierarchy synckey.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hierarchy: Option<String>,
    /// Synckeys awaiting confirmation.
    pub confirmed_synckeys: Vec<String>,
    /// Looping sync interval in seconds, from hbinterval or wait.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<u64>,
    /// Start of the last looping sync.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lasthbsyncstarted: Option<i64>,
    /// End of the last looping sync that ended normally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lastsyncendnormal: Option<i64>,
    /// Time of the last save.
    pub timestamp: i64,
    /// Number of cached folders.
    pub folder_count: usize,
    /// Cached collections.
    pub collections: Vec<CollectionSummary>,
}

/// One cached collection.
#[derive(Debug, Serialize)]
pub struct CollectionSummary {
    /// Collection id.
    pub id: String,
    /// Collection class.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    /// Durable synckey.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synckey: Option<String>,
    /// Stored state keys.
    pub states: usize,
    /// Watched by PING.
    pub pingable: bool,
    /// A PING saw changes not yet synced.
    pub pingchange: bool,
}

/// Builds the inspection result of one sync cache.
pub fn inspect(
    store: &dyn StateStore,
    device: &str,
    user: &str,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let known = store
        .list_sync_caches()?
        .iter()
        .any(|(d, u)| d == device && u == user);
    if !known {
        return Err(format!("No sync cache for device {device}, user {user}").into());
    }
    let record = store.get_sync_cache(device, user, None)?;

    let mut collections = Vec::new();
    for (id, collection) in &record.collections {
        let states = store.collection_state_keys(device, user, id)?.len();
        collections.push(CollectionSummary {
            id: id.clone(),
            class: collection.class.map(|c| c.as_str().to_string()),
            synckey: collection
                .lastsynckey
                .as_ref()
                .or(collection.synckey.as_ref())
                .map(ToString::to_string),
            states,
            pingable: collection.pingable,
            pingchange: collection.pingchange,
        });
    }

    Ok(InspectResult {
        device: device.to_string(),
        user: user.to_string(),
        hierarchy: record.hierarchy.as_ref().map(ToString::to_string),
        confirmed_synckeys: record
            .confirmed_synckeys
            .iter()
            .map(ToString::to_string)
            .collect(),
        heartbeat: heartbeat(&record),
        lasthbsyncstarted: record.lasthbsyncstarted,
        lastsyncendnormal: record.lastsyncendnormal,
        timestamp: record.timestamp,
        folder_count: record.folders.len(),
        collections,
    })
}

fn heartbeat(record: &SyncCacheRecord) -> Option<u64> {
    match (record.hbinterval, record.wait) {
        (Some(hb), _) if hb > 0 => Some(hb),
        (_, Some(wait)) if wait > 0 => Some(wait * 60),
        _ => None,
    }
}

/// Runs the inspect command.
pub fn run(
    store: &dyn StateStore,
    device: &str,
    user: &str,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(store, device, user)?;
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("easync Sync Cache");
    println!("=================");
    println!();
    println!("Device: {}", result.device);
    println!("User:   {}", result.user);
    println!();
    println!("Session:");
    println!(
        "  Hierarchy key: {}",
        result.hierarchy.as_deref().unwrap_or("-")
    );
    println!("  Unconfirmed:   {}", result.confirmed_synckeys.len());
    match result.heartbeat {
        Some(hb) => println!("  Heartbeat:     {hb} s"),
        None => println!("  Heartbeat:     -"),
    }
    println!("  Last save:     {}", result.timestamp);
    println!("  Folders:       {}", result.folder_count);

    if !result.collections.is_empty() {
        println!();
        println!("Collections:");
        for col in &result.collections {
            let mut flags = Vec::new();
            if col.pingable {
                flags.push("pingable");
            }
            if col.pingchange {
                flags.push("pingchange");
            }
            println!(
                "  [{}] {} key={} states={} {}",
                col.id,
                col.class.as_deref().unwrap_or("?"),
                col.synckey.as_deref().unwrap_or("-"),
                col.states,
                flags.join(",")
            );
        }
    }
}
