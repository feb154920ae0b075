//! easync CLI
//!
//! Administration tools for a directory of easync session state.
//!
//! # Commands
//!
//! - `inspect` - Display a device's sync cache
//! - `devices` - List known devices and users
//! - `reset` - Force a collection to resynchronize
//! - `delete` - Delete a device's sync cache and states
//! - `wipe` - Request or clear a remote wipe

mod commands;

use clap::{Parser, Subcommand};
use easync_state::FileStateStore;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// easync session state tools.
#[derive(Parser)]
#[command(name = "easync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the state directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display a device's sync cache
    Inspect {
        /// Device id
        #[arg(short, long)]
        device: String,

        /// User name
        #[arg(short, long)]
        user: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List known devices and users
    Devices {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Force a collection to resynchronize
    Reset {
        /// Device id
        #[arg(short, long)]
        device: String,

        /// User name
        #[arg(short, long)]
        user: String,

        /// Collection id
        #[arg(short, long)]
        collection: String,

        /// Forget the collection entirely
        #[arg(long)]
        purge: bool,
    },

    /// Delete a device's sync cache and states
    Delete {
        /// Device id
        #[arg(short, long)]
        device: String,

        /// User name
        #[arg(short, long)]
        user: String,
    },

    /// Request or clear a remote wipe
    Wipe {
        /// Device id
        #[arg(short, long)]
        device: String,

        /// Clear a pending wipe instead of requesting one
        #[arg(long)]
        clear: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let open = |command: &str| -> Result<FileStateStore, Box<dyn std::error::Error>> {
        let path = cli
            .path
            .clone()
            .ok_or_else(|| format!("State path required for {command}"))?;
        Ok(FileStateStore::open(path)?)
    };

    match cli.command {
        Commands::Inspect {
            ref device,
            ref user,
            ref format,
        } => {
            let store = open("inspect")?;
            commands::inspect::run(&store, device, user, format)?;
        }
        Commands::Devices { ref format } => {
            let store = open("devices")?;
            commands::devices::run(&store, format)?;
        }
        Commands::Reset {
            ref device,
            ref user,
            ref collection,
            purge,
        } => {
            let store = open("reset")?;
            if !commands::reset::run(&store, device, user, collection, purge)? {
                return Err(format!("No cached collection {collection}").into());
            }
        }
        Commands::Delete {
            ref device,
            ref user,
        } => {
            let store = open("delete")?;
            commands::delete::run(&store, device, user)?;
        }
        Commands::Wipe { ref device, clear } => {
            let store = open("wipe")?;
            commands::wipe::run(&store, device, clear)?;
        }
        Commands::Version => {
            println!("easync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
