//! # Main — CLI Entry Point
//!
//! Routes subcommands to the sync controller, the HTTP control surface, and
//! the history store.
//!
//! ## Subcommands
//!
//! - `sync --direction <local_to_remote|remote_to_local>`: run one sync in
//!   this process, behind the interactive safety gate unless `--skip-confirm`.
//! - `serve`: HTTP API + WebSocket streams for the dashboard.
//! - `status <sync_id>`, `history`: read the history store.
//! - `watch <sync_id>`: follow a sync on a running server.
//! - `tables`: print the synced table registry.
//! - `recover`: fail `running` records left behind by a crashed process.
//!
//! ## Global Options
//!
//! - `--database-url` / `DATABASE_URL`: history store. Without it, history is
//!   kept in memory for the life of the process.
//! - `--local-url` / `LOCAL_DATABASE_URL`, `--remote-url` /
//!   `REMOTE_DATABASE_URL`: the two databases being synced.
//! - `--config`: TOML file with tuning knobs (see `config::SyncConfig`).
//!
//! ## Exit codes
//!
//! 0 success, 1 invalid arguments, 2 connectivity failure, 3 export/import
//! failure, 4 verification mismatch, 5 cancelled.

mod cli;

use clap::error::ErrorKind as ClapErrorKind;
use clap::{Parser, Subcommand};
use dbsync::record::{Direction, SyncStatus};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "dbsync",
    version,
    about = "Full-dump PostgreSQL sync between a local and a remote database"
)]
struct Cli {
    /// PostgreSQL URL of the sync history store (or set DATABASE_URL)
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Local database URL (or set LOCAL_DATABASE_URL)
    #[arg(long, env = "LOCAL_DATABASE_URL", global = true)]
    local_url: Option<String>,

    /// Remote database URL (or set REMOTE_DATABASE_URL)
    #[arg(long, env = "REMOTE_DATABASE_URL", global = true)]
    remote_url: Option<String>,

    /// TOML configuration file
    #[arg(long, env = "DBSYNC_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync in this process
    Sync {
        /// local_to_remote or remote_to_local
        #[arg(long)]
        direction: Direction,
        /// Validate and export only; leave the target untouched
        #[arg(long)]
        dry_run: bool,
        /// Skip the interactive confirmation (automation)
        #[arg(long)]
        skip_confirm: bool,
        /// Recorded as the initiator of the sync
        #[arg(long, default_value = "cli")]
        triggered_by: String,
    },
    /// Start the HTTP control surface
    Serve {
        /// Port to listen on
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Print the stored record of a sync
    Status {
        sync_id: String,
    },
    /// List past syncs
    History {
        /// Filter by direction
        #[arg(long)]
        direction: Option<Direction>,
        /// Filter by status (running, completed, failed, cancelled)
        #[arg(long)]
        status: Option<SyncStatus>,
        /// Maximum number of records
        #[arg(long, default_value_t = 25)]
        limit: u32,
        /// Emit CSV instead of a table
        #[arg(long)]
        csv: bool,
    },
    /// Follow a sync on a running server until it finishes
    Watch {
        sync_id: String,
        /// Base URL of `dbsync serve`
        #[arg(long, env = "DBSYNC_SERVER_URL", default_value = "http://127.0.0.1:8080")]
        server: String,
    },
    /// Print the synced table registry
    Tables,
    /// Mark syncs orphaned by a crashed process as failed
    Recover,
}

fn main() {
    let _ = dotenvy::dotenv();

    // Initialize structured logging: LOG_FORMAT=json for containers, human-readable otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let code = match cli::run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            e.downcast_ref::<dbsync::SyncError>()
                .map(|se| se.exit_code())
                .unwrap_or(1)
        }
    };
    std::process::exit(code);
}
