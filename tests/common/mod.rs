//! Shared test helpers for integration tests.
//!
//! - [`FakeDatabase`]: an in-memory [`SyncEndpoint`] holding per-table row
//!   counts, with switches for unreachability and index rebuild failure.
//! - [`FakeDumpTool`]: a [`DumpTool`] that writes plain-text artifacts
//!   (`CREATE TABLE` lines only in full mode, one `COPY` block per table) and
//!   restores them into the fakes with single-transaction semantics.
//! - [`Harness`]: a controller wired to both fakes and an in-memory history
//!   store, with artifact and backup directories under a temp dir.
//! - `TEST_DATABASE_URL` helpers for the PostgreSQL-backed suites.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use dbsync::broadcast::StatusBroadcaster;
use dbsync::config::SyncConfig;
use dbsync::controller::{SyncController, SyncRequest};
use dbsync::endpoint::{Endpoints, SyncEndpoint};
use dbsync::error::{SyncError, SyncResult};
use dbsync::executor::{DumpTool, TableLoaded};
use dbsync::history::{HistoryFilter, HistoryPage, HistoryStats, HistoryStore, MemoryHistoryStore};
use dbsync::prom_metrics::Metrics;
use dbsync::record::{Completion, Direction, ExportMode, Side, SyncProgress, SyncRecord};
use dbsync::tables::SYNC_TABLES;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use tokio::sync::{mpsc, Notify};

// ── PostgreSQL helpers ──────────────────────────────────────────

/// Returns the test database URL from the `TEST_DATABASE_URL` environment variable.
/// Panics if the variable is not set.
pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set for integration tests")
}

/// Returns true if the test database URL is configured.
pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

static SCHEMA_INIT: Once = Once::new();

/// Ensure the `sync_history` table exists (once per test binary).
pub fn ensure_schema() {
    // Callers are already inside a tokio runtime; build the setup runtime
    // on its own thread.
    SCHEMA_INIT.call_once(|| {
        std::thread::spawn(|| {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let db = dbsync::db::Database::connect(&test_db_url()).await.unwrap();
                db.ensure_schema().await.unwrap();
            });
        })
        .join()
        .unwrap();
    });
}

/// Connect to the test database with an empty `sync_history`.
pub async fn setup_test_db() -> dbsync::db::Database {
    ensure_schema();
    let db = dbsync::db::Database::connect(&test_db_url())
        .await
        .expect("Failed to connect to test database");
    sqlx::raw_sql("TRUNCATE TABLE sync_history")
        .execute(db.pool())
        .await
        .unwrap();
    db
}

// ── Fake database ───────────────────────────────────────────────

pub const MIGRATION_VERSION: &str = "20240601000000";

pub struct FakeState {
    /// Present tables and their row counts.
    pub tables: BTreeMap<String, i64>,
    pub reachable: bool,
    pub free_disk: Option<u64>,
    pub size_bytes: u64,
    pub migration_version: Option<String>,
    pub fail_rebuild: bool,
    pub truncations: usize,
    pub reindexed: Vec<String>,
}

pub struct FakeDatabase {
    side: Side,
    url: String,
    state: Mutex<FakeState>,
}

impl FakeDatabase {
    /// Reachable, roomy, and with none of the registry tables.
    pub fn empty(side: Side) -> Arc<Self> {
        Self::empty_at(side, &format!("fake://{}", side))
    }

    /// [`FakeDatabase::empty`] reporting `url` as its connection URL.
    pub fn empty_at(side: Side, url: &str) -> Arc<Self> {
        Arc::new(FakeDatabase {
            side,
            url: url.to_string(),
            state: Mutex::new(FakeState {
                tables: BTreeMap::new(),
                reachable: true,
                free_disk: Some(1 << 40),
                size_bytes: 1 << 20,
                migration_version: None,
                fail_rebuild: false,
                truncations: 0,
                reindexed: Vec::new(),
            }),
        })
    }

    /// Every registry table present, table `i` holding `base + i` rows.
    pub fn populated(side: Side, base: i64) -> Arc<Self> {
        let db = Self::empty(side);
        {
            let mut state = db.state();
            for (i, table) in SYNC_TABLES.iter().enumerate() {
                state.tables.insert(table.to_string(), base + i as i64);
            }
            state.migration_version = Some(MIGRATION_VERSION.to_string());
        }
        db
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn counts(&self) -> BTreeMap<String, i64> {
        self.state().tables.clone()
    }

    pub fn set_rows(&self, table: &str, rows: i64) {
        self.state().tables.insert(table.to_string(), rows);
    }
}

#[async_trait]
impl SyncEndpoint for FakeDatabase {
    fn side(&self) -> Side {
        self.side
    }

    fn schema(&self) -> &str {
        "public"
    }

    fn connection_url(&self) -> &str {
        &self.url
    }

    async fn ping(&self) -> Result<()> {
        if !self.state().reachable {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }

    async fn existing_tables(&self, tables: &[String]) -> Result<Vec<String>> {
        let state = self.state();
        Ok(tables
            .iter()
            .filter(|t| state.tables.contains_key(t.as_str()))
            .cloned()
            .collect())
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        self.state()
            .tables
            .get(table)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("relation \"public.{}\" does not exist", table))
    }

    async fn truncate(&self, tables: &[String]) -> Result<()> {
        let mut state = self.state();
        for table in tables {
            if let Some(rows) = state.tables.get_mut(table) {
                *rows = 0;
            }
        }
        state.truncations += 1;
        Ok(())
    }

    async fn tables_size(&self, _tables: &[String]) -> Result<u64> {
        Ok(self.state().size_bytes)
    }

    async fn free_disk_bytes(&self) -> Result<Option<u64>> {
        Ok(self.state().free_disk)
    }

    async fn migration_version(&self) -> Result<Option<String>> {
        Ok(self.state().migration_version.clone())
    }

    async fn rebuild_indexes(&self, tables: &[String]) -> Result<()> {
        let mut state = self.state();
        if state.fail_rebuild {
            anyhow::bail!("could not rebuild index: out of maintenance_work_mem");
        }
        state.reindexed.extend(tables.iter().cloned());
        Ok(())
    }
}

// ── Fake dump tool ──────────────────────────────────────────────

/// Holds a sync's import open until released.
#[derive(Default)]
pub struct ImportGate {
    pub entered: Notify,
    pub release: Notify,
}

pub struct FakeDumpTool {
    local: Arc<FakeDatabase>,
    remote: Arc<FakeDatabase>,
    /// Fail imports of sync artifacts (not backup restores).
    pub fail_import: AtomicBool,
    /// Fail restores of backup artifacts.
    pub fail_rollback: AtomicBool,
    /// Load one row fewer into this table than the artifact holds.
    pub short_table: Mutex<Option<String>>,
    pub gate: Option<Arc<ImportGate>>,
    pub dumps: Mutex<Vec<(PathBuf, ExportMode)>>,
}

impl FakeDumpTool {
    pub fn new(local: &Arc<FakeDatabase>, remote: &Arc<FakeDatabase>) -> Self {
        FakeDumpTool {
            local: Arc::clone(local),
            remote: Arc::clone(remote),
            fail_import: AtomicBool::new(false),
            fail_rollback: AtomicBool::new(false),
            short_table: Mutex::new(None),
            gate: None,
            dumps: Mutex::new(Vec::new()),
        }
    }

    pub fn with_gate(mut self, gate: Arc<ImportGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn db(&self, side: Side) -> &Arc<FakeDatabase> {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }
}

fn bare(qualified: &str) -> &str {
    qualified.rsplit('.').next().unwrap_or(qualified)
}

/// Sync artifacts are named `<sync_id>-<side>.sql`; backups `<side>-<sync_id>.sql`.
fn is_sync_artifact(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("sync_"))
}

fn import_failure(message: &str) -> SyncError {
    SyncError::ImportFailure {
        message: message.to_string(),
        exit_code: Some(3),
        output_tail: Some(format!("ERROR:  {}", message)),
    }
}

#[async_trait]
impl DumpTool for FakeDumpTool {
    async fn dump(
        &self,
        source: &dyn SyncEndpoint,
        tables: &[String],
        mode: ExportMode,
        out: &Path,
    ) -> SyncResult<()> {
        let counts = self.db(source.side()).counts();
        let mut text = format!("-- fake dump of {} ({})\n", source.side(), mode.as_str());
        for table in tables {
            let Some(rows) = counts.get(bare(table)) else {
                continue;
            };
            if mode == ExportMode::Full {
                text.push_str(&format!("CREATE TABLE {} ();\n", table));
            }
            text.push_str(&format!("COPY {} (id) FROM stdin;\nrows={}\n\\.\n", table, rows));
        }
        tokio::fs::write(out, text)
            .await
            .map_err(|e| SyncError::ExportFailure {
                message: e.to_string(),
                exit_code: None,
                output_tail: None,
            })?;
        self.dumps.lock().unwrap().push((out.to_path_buf(), mode));
        Ok(())
    }

    async fn restore(
        &self,
        target: &dyn SyncEndpoint,
        artifact: &Path,
        progress: mpsc::UnboundedSender<TableLoaded>,
    ) -> SyncResult<String> {
        let sync_artifact = is_sync_artifact(artifact);
        if sync_artifact {
            if let Some(gate) = &self.gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
        }
        let text = tokio::fs::read_to_string(artifact)
            .await
            .map_err(|e| import_failure(&e.to_string()))?;

        // Parse everything first; nothing is applied unless the whole
        // artifact succeeds.
        let mut created = Vec::new();
        let mut loads: Vec<(String, i64)> = Vec::new();
        let mut current: Option<String> = None;
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("CREATE TABLE ") {
                created.push(bare(rest.split(' ').next().unwrap_or_default()).to_string());
            } else if let Some(rest) = line.strip_prefix("COPY ") {
                current = Some(bare(rest.split(' ').next().unwrap_or_default()).to_string());
            } else if let Some(rows) = line.strip_prefix("rows=") {
                if let Some(table) = current.take() {
                    loads.push((table, rows.parse().unwrap_or(0)));
                }
            }
        }

        let db = self.db(target.side());
        let existing = db.counts();
        for (table, _) in &loads {
            if !existing.contains_key(table) && !created.contains(table) {
                return Err(import_failure(&format!(
                    "relation \"public.{}\" does not exist",
                    table
                )));
            }
        }

        if sync_artifact && self.fail_import.load(Ordering::SeqCst) {
            for (table, rows) in loads.iter().take(3) {
                let _ = progress.send(TableLoaded {
                    table_name: table.clone(),
                    row_count: *rows,
                });
            }
            return Err(import_failure("server closed the connection unexpectedly"));
        }
        if !sync_artifact && self.fail_rollback.load(Ordering::SeqCst) {
            return Err(import_failure("could not read backup: permission denied"));
        }

        let short = self.short_table.lock().unwrap().clone();
        let mut raw = String::new();
        for (table, rows) in loads {
            let loaded = if short.as_deref() == Some(table.as_str()) {
                rows - 1
            } else {
                rows
            };
            db.set_rows(&table, loaded);
            raw.push_str(&format!("COPY {}\n", loaded));
            let _ = progress.send(TableLoaded {
                table_name: table,
                row_count: loaded,
            });
        }
        Ok(raw)
    }
}

/// Panics as soon as an export starts.
pub struct PanickingTool;

#[async_trait]
impl DumpTool for PanickingTool {
    async fn dump(
        &self,
        _source: &dyn SyncEndpoint,
        _tables: &[String],
        _mode: ExportMode,
        _out: &Path,
    ) -> SyncResult<()> {
        panic!("pg_dump wrapper blew up");
    }

    async fn restore(
        &self,
        _target: &dyn SyncEndpoint,
        _artifact: &Path,
        _progress: mpsc::UnboundedSender<TableLoaded>,
    ) -> SyncResult<String> {
        panic!("psql wrapper blew up");
    }
}

// ── Shared store ────────────────────────────────────────────────

/// The in-memory store, yielding after every `running()` read so two
/// admissions can both pass the running check before either inserts. Stands
/// in for two processes sharing one history database.
pub struct YieldingStore(pub Arc<MemoryHistoryStore>);

#[async_trait]
impl HistoryStore for YieldingStore {
    async fn create(&self, record: &SyncRecord) -> Result<()> {
        self.0.create(record).await
    }

    async fn update_progress(
        &self,
        sync_id: &str,
        progress: &SyncProgress,
    ) -> Result<Option<SyncRecord>> {
        self.0.update_progress(sync_id, progress).await
    }

    async fn complete(&self, sync_id: &str, completion: &Completion) -> Result<Option<SyncRecord>> {
        self.0.complete(sync_id, completion).await
    }

    async fn get(&self, sync_id: &str) -> Result<Option<SyncRecord>> {
        self.0.get(sync_id).await
    }

    async fn list(&self, filter: &HistoryFilter) -> Result<HistoryPage> {
        self.0.list(filter).await
    }

    async fn stats(&self, window_days: i64) -> Result<HistoryStats> {
        self.0.stats(window_days).await
    }

    async fn running(&self) -> Result<Vec<SyncRecord>> {
        let running = self.0.running().await;
        tokio::task::yield_now().await;
        running
    }

    async fn health_check(&self) -> Result<()> {
        self.0.health_check().await
    }
}

// ── Harness ─────────────────────────────────────────────────────

pub fn test_config(dir: &Path) -> SyncConfig {
    SyncConfig {
        artifact_dir: dir.join("artifacts"),
        backup_dir: dir.join("backups"),
        ..SyncConfig::default()
    }
}

pub struct Harness {
    pub local: Arc<FakeDatabase>,
    pub remote: Arc<FakeDatabase>,
    pub tool: Arc<FakeDumpTool>,
    pub store: Arc<MemoryHistoryStore>,
    pub metrics: Arc<Metrics>,
    pub controller: SyncController,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(local: Arc<FakeDatabase>, remote: Arc<FakeDatabase>) -> Self {
        let tool = FakeDumpTool::new(&local, &remote);
        Self::with_tool(local, remote, tool)
    }

    pub fn with_tool(local: Arc<FakeDatabase>, remote: Arc<FakeDatabase>, tool: FakeDumpTool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(tool);
        let store = Arc::new(MemoryHistoryStore::new());
        let metrics = Arc::new(Metrics::new());
        let endpoints = Endpoints::new(
            Arc::clone(&local) as Arc<dyn SyncEndpoint>,
            Arc::clone(&remote) as Arc<dyn SyncEndpoint>,
        );
        let controller = SyncController::new(
            endpoints,
            Arc::clone(&tool) as Arc<dyn DumpTool>,
            Arc::clone(&store) as Arc<dyn HistoryStore>,
            Arc::new(StatusBroadcaster::new()),
            Arc::clone(&metrics),
            Arc::new(test_config(dir.path())),
        );
        Harness {
            local,
            remote,
            tool,
            store,
            metrics,
            controller,
            dir,
        }
    }

    /// Another controller over the same fakes, with its own concurrency
    /// guard, as a second process would have.
    pub fn controller(&self, tool: Arc<dyn DumpTool>, store: Arc<dyn HistoryStore>) -> SyncController {
        let endpoints = Endpoints::new(
            Arc::clone(&self.local) as Arc<dyn SyncEndpoint>,
            Arc::clone(&self.remote) as Arc<dyn SyncEndpoint>,
        );
        SyncController::new(
            endpoints,
            tool,
            store,
            Arc::new(StatusBroadcaster::new()),
            Arc::new(Metrics::new()),
            Arc::new(test_config(self.dir.path())),
        )
    }

    /// Start a sync and wait for its terminal record.
    pub async fn run(&self, direction: Direction) -> SyncRecord {
        self.run_request(request(direction)).await
    }

    pub async fn run_request(&self, request: SyncRequest) -> SyncRecord {
        let started = self.controller.start(request).await.unwrap();
        started.handle.await.unwrap()
    }

    pub fn side(&self, side: Side) -> &Arc<FakeDatabase> {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }
}

pub fn request(direction: Direction) -> SyncRequest {
    SyncRequest {
        direction,
        dry_run: false,
        triggered_by: "test".to_string(),
    }
}
