//! # CLI Execution Functions
//!
//! Extracted from `main.rs` to keep the entry point slim. Each subcommand
//! returns the process exit code; errors bubble up to `main`, which maps
//! them to a code through `SyncError::exit_code`.

use anyhow::Result;
use dbsync::broadcast::StatusBroadcaster;
use dbsync::config::{self, SyncConfig};
use dbsync::controller::{exit_code_for, recover_interrupted, SyncController, SyncRequest};
use dbsync::db::{self, Database};
use dbsync::endpoint::{Endpoints, PgEndpoint};
use dbsync::error::ErrorKind;
use dbsync::executor::PgDumpTool;
use dbsync::history::{to_csv, HistoryFilter, HistoryStore, MemoryHistoryStore};
use dbsync::prom_metrics::Metrics;
use dbsync::record::{Direction, Side, SyncRecord};
use dbsync::tables::{qualified, EXCLUDED_TABLES, SYNC_TABLES};
use dbsync::watch::{Channel, HttpTransport, ProgressView, ReconnectPolicy, Watcher};
use dbsync::{confirm, dashboard};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use super::{Cli, Commands};

pub fn run(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Commands::Tables => {
            let config = load_config(cli)?;
            print_tables(&config);
            Ok(0)
        }
        Commands::Sync {
            direction,
            dry_run,
            skip_confirm,
            triggered_by,
        } => {
            let config = load_config(cli)?;
            // Validate URLs before asking the operator anything.
            config.local_url()?;
            config.remote_url()?;
            if !skip_confirm && !confirm::confirm_stdin(*direction, *dry_run)? {
                eprintln!("Sync aborted: confirmation not given");
                return Ok(ErrorKind::CancelledByUser.exit_code());
            }
            let request = SyncRequest {
                direction: *direction,
                dry_run: *dry_run,
                triggered_by: triggered_by.clone(),
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_sync(cli, config, request))
        }
        Commands::Serve { port } => {
            let config = load_config(cli)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_serve(cli, config, *port))
        }
        Commands::Status { sync_id } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_status(cli, sync_id))
        }
        Commands::History {
            direction,
            status,
            limit,
            csv,
        } => {
            let filter = HistoryFilter {
                direction: *direction,
                status: *status,
                per_page: Some(*limit),
                ..Default::default()
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_history(cli, filter, *csv))
        }
        Commands::Watch { sync_id, server } => {
            let config = load_config(cli)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_watch(&config, sync_id, server))
        }
        Commands::Recover => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_recover(cli))
        }
    }
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    Ok(config::load(cli.config.as_deref())?
        .with_urls(cli.local_url.as_deref(), cli.remote_url.as_deref()))
}

/// PostgreSQL history when a URL is configured, otherwise process memory.
async fn open_store(database_url: Option<&str>) -> Result<Arc<dyn HistoryStore>> {
    match database_url {
        Some(url) => {
            let database = Database::connect(url).await?;
            database.ensure_schema().await?;
            info!(url = %db::redact_url(url), "history store connected");
            Ok(Arc::new(database))
        }
        None => {
            warn!("DATABASE_URL not set; sync history is kept in memory only");
            Ok(Arc::new(MemoryHistoryStore::new()))
        }
    }
}

async fn require_store(cli: &Cli) -> Result<Arc<dyn HistoryStore>> {
    let url = cli.database_url.as_deref().ok_or_else(|| {
        anyhow::anyhow!("DATABASE_URL is required (set via --database-url or env)")
    })?;
    open_store(Some(url)).await
}

fn build_controller(
    config: SyncConfig,
    store: Arc<dyn HistoryStore>,
    metrics: Arc<Metrics>,
) -> Result<SyncController> {
    let local = PgEndpoint::connect_lazy(Side::Local, config.local_url()?, &config)?;
    let remote = PgEndpoint::connect_lazy(Side::Remote, config.remote_url()?, &config)?;
    let tool = PgDumpTool::from_config(&config);
    Ok(SyncController::new(
        Endpoints::new(Arc::new(local), Arc::new(remote)),
        Arc::new(tool),
        store,
        Arc::new(StatusBroadcaster::new()),
        metrics,
        Arc::new(config),
    ))
}

// ── Sync ────────────────────────────────────────────────────────

async fn run_sync(cli: &Cli, config: SyncConfig, request: SyncRequest) -> Result<i32> {
    let store = open_store(cli.database_url.as_deref()).await?;
    let controller = build_controller(config, store, Arc::new(Metrics::new()))?;
    let direction: Direction = request.direction;
    // Subscribed before admission so a sync that fails fast is still seen.
    let mut updates = controller.broadcaster().subscribe_all();

    let started = match controller.start(request).await {
        Ok(started) => started,
        Err(e) => {
            eprintln!("Sync not started: {}", e);
            return Ok(e.exit_code());
        }
    };
    let sync_id = started.sync_id.clone();
    eprintln!("Sync {} started ({})", sync_id, direction);

    let watched = sync_id.clone();
    let printer = tokio::spawn(async move {
        let mut view = ProgressView::default();
        loop {
            let record = match updates.recv().await {
                Ok(record) => record,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            if record.sync_id != watched {
                continue;
            }
            if view.merge(record) {
                if let Some(current) = view.current() {
                    print_progress(current);
                }
            }
            if view.is_terminal() {
                break;
            }
        }
    });

    let mut handle = started.handle;
    let record = tokio::select! {
        joined = &mut handle => joined?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling; the current phase will finish first...");
            if let Err(e) = controller.cancel(&sync_id).await {
                warn!(sync_id = %sync_id, error = %e, "cancel request failed");
            }
            handle.await?
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(2), printer).await;

    println!("{}", record.summary());
    if let Some(path) = &record.backup_file_path {
        eprintln!("Pre-import backup: {}", path);
    }
    Ok(exit_code_for(&record))
}

async fn run_serve(cli: &Cli, config: SyncConfig, port: u16) -> Result<i32> {
    let store = open_store(cli.database_url.as_deref()).await?;
    let metrics = Arc::new(Metrics::new());
    let controller = build_controller(config, store, Arc::clone(&metrics))?;
    dashboard::run(port, controller, metrics).await?;
    Ok(0)
}

// ── History ─────────────────────────────────────────────────────

async fn run_status(cli: &Cli, sync_id: &str) -> Result<i32> {
    let store = require_store(cli).await?;
    match store.get(sync_id).await? {
        Some(record) => {
            print_record(&record);
            Ok(0)
        }
        None => {
            eprintln!("Sync {} not found", sync_id);
            Ok(1)
        }
    }
}

async fn run_history(cli: &Cli, filter: HistoryFilter, csv: bool) -> Result<i32> {
    let store = require_store(cli).await?;
    let page = store.list(&filter).await?;
    if csv {
        print!("{}", to_csv(&page.records));
    } else {
        print_history(&page.records, page.total);
    }
    Ok(0)
}

/// Orphaned `running` records can only be told apart from a live sync by
/// the operator, so this runs on request and treats every one as orphaned.
async fn run_recover(cli: &Cli) -> Result<i32> {
    let store = require_store(cli).await?;
    let broadcaster = StatusBroadcaster::new();
    let recovered = recover_interrupted(store.as_ref(), &broadcaster, |_| false).await?;
    println!("Recovered {} interrupted sync(s)", recovered);
    Ok(0)
}

async fn run_watch(config: &SyncConfig, sync_id: &str, server: &str) -> Result<i32> {
    let watcher = Watcher::new(
        HttpTransport::new(server)?,
        ReconnectPolicy::from_config(config),
    );
    let poll_interval = config.poll_interval();
    let mut last_channel = None;
    let record = watcher
        .watch(sync_id, |record, channel| {
            if last_channel != Some(channel) {
                if channel == Channel::Poll {
                    eprintln!("(stream lost, polling every {}s)", poll_interval.as_secs());
                }
                last_channel = Some(channel);
            }
            print_progress(record);
        })
        .await?;
    println!("{}", record.summary());
    Ok(exit_code_for(&record))
}

// ── Output ──────────────────────────────────────────────────────

fn print_progress(record: &SyncRecord) {
    let table = record
        .current_table
        .as_deref()
        .map(|t| format!(" {}", t))
        .unwrap_or_default();
    eprintln!(
        "[{:>3}%] {:<13}{} rows {}/{}",
        record.percent_complete,
        record.current_phase.as_str(),
        table,
        record.synced_rows,
        record.total_rows
    );
}

fn print_record(record: &SyncRecord) {
    match serde_json::to_string_pretty(record) {
        Ok(json) => println!("{}", json),
        Err(e) => warn!(error = %e, "cannot render record as JSON"),
    }
    println!();
    println!("{}", record.summary());
}

fn print_history(records: &[SyncRecord], total: i64) {
    if records.is_empty() {
        eprintln!("No syncs recorded");
        return;
    }
    println!(
        "{:<34} {:<16} {:<10} {:>5} {:>10} {:>10}  Started",
        "Sync ID", "Direction", "Status", "%", "Rows", "Duration"
    );
    println!("{}", "-".repeat(110));
    for r in records {
        let duration = r
            .duration_ms
            .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<34} {:<16} {:<10} {:>5} {:>10} {:>10}  {}",
            r.sync_id,
            r.direction.as_str(),
            r.status.as_str(),
            r.percent_complete,
            r.rows_synced(),
            duration,
            r.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    if total > records.len() as i64 {
        eprintln!("({} of {} shown)", records.len(), total);
    }
}

fn print_tables(config: &SyncConfig) {
    println!("Synced tables ({}):", SYNC_TABLES.len());
    for table in SYNC_TABLES {
        let heavy = if config.heavy_index_tables.iter().any(|t| t == table) {
            "  [reindexed after remote_to_local]"
        } else {
            ""
        };
        println!("  {}{}", qualified(&config.schema, table), heavy);
    }
    println!("Never synced:");
    for table in EXCLUDED_TABLES {
        println!("  {}", qualified(&config.schema, table));
    }
}
