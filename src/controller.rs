//! # Controller — Sync State Machine
//!
//! Sequences one sync attempt through its phases on a background task:
//!
//! ```text
//! validation -> export -> preparation -> import -> [indexing] -> verification
//!            \-> completed (dry run)                              \-> completed
//! ```
//!
//! Indexing runs only for `remote_to_local`; the other direction passes
//! straight from import to verification.
//!
//! ## Side effects per update
//!
//! Every phase entry and progress tick is written to the history store and
//! then published to the broadcaster before the controller moves on. A store
//! write failure aborts the sync.
//!
//! ## Cancellation and rollback
//!
//! `cancel` sets a flag observed at the next phase boundary; in-flight
//! export/import is never interrupted. Once the target has been touched
//! (preparation began), cancellation or a fatal error in preparation/import
//! triggers rollback from the pre-import backup. A failed rollback fails the
//! sync with `rollback_failure`, whatever the original outcome was.
//!
//! ## Crash recovery
//!
//! [`SyncController::recover_interrupted`] marks `running` records that no
//! task in this process owns as `failed` with kind `interrupted`.

use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

use crate::broadcast::StatusBroadcaster;
use crate::config::SyncConfig;
use crate::endpoint::{Endpoints, SyncEndpoint};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::executor::{DumpTool, Executor, TableLoaded};
use crate::guard::{ConcurrencyGuard, SyncPermit};
use crate::history::HistoryStore;
use crate::prepare::prepare;
use crate::prom_metrics::Metrics;
use crate::record::{
    new_sync_id, Completion, Direction, SyncPhase, SyncProgress, SyncRecord, SyncStatus, TableSync,
};
use crate::tables::sync_tables;
use crate::validate::Validator;
use crate::verify::{mismatched, verify};

/// Admission request.
#[derive(Clone, Debug)]
pub struct SyncRequest {
    pub direction: Direction,
    pub dry_run: bool,
    pub triggered_by: String,
}

/// An admitted sync. The handle resolves to the terminal record.
pub struct StartedSync {
    pub sync_id: String,
    pub handle: JoinHandle<SyncRecord>,
}

#[derive(Error, Debug)]
pub enum CancelError {
    #[error("sync {0} not found")]
    NotFound(String),
    #[error("sync {0} already {1}")]
    AlreadyFinished(String, SyncStatus),
    #[error("sync {0} is not owned by this process")]
    NotOwned(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// CLI exit code for a terminal record.
pub fn exit_code_for(record: &SyncRecord) -> i32 {
    match record.status {
        SyncStatus::Completed if record.verification_passed == Some(false) => {
            ErrorKind::VerificationMismatch.exit_code()
        }
        SyncStatus::Completed => 0,
        SyncStatus::Cancelled => ErrorKind::CancelledByUser.exit_code(),
        SyncStatus::Running => 1,
        SyncStatus::Failed => record
            .error_details
            .as_ref()
            .and_then(|d| d.get("kind"))
            .and_then(|k| serde_json::from_value::<ErrorKind>(k.clone()).ok())
            .map(ErrorKind::exit_code)
            .unwrap_or(1),
    }
}

struct Inner {
    endpoints: Endpoints,
    executor: Executor,
    validator: Validator,
    store: Arc<dyn HistoryStore>,
    broadcaster: Arc<StatusBroadcaster>,
    metrics: Arc<Metrics>,
    config: Arc<SyncConfig>,
    guard: ConcurrencyGuard,
    cancels: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl Inner {
    fn cancels(&self) -> MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        self.cancels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct SyncController {
    inner: Arc<Inner>,
}

impl SyncController {
    pub fn new(
        endpoints: Endpoints,
        tool: Arc<dyn DumpTool>,
        store: Arc<dyn HistoryStore>,
        broadcaster: Arc<StatusBroadcaster>,
        metrics: Arc<Metrics>,
        config: Arc<SyncConfig>,
    ) -> Self {
        SyncController {
            inner: Arc::new(Inner {
                validator: Validator::new(endpoints.clone(), Arc::clone(&config)),
                executor: Executor::new(tool, Arc::clone(&config)),
                endpoints,
                store,
                broadcaster,
                metrics,
                config,
                guard: ConcurrencyGuard::new(),
                cancels: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.inner.store
    }

    pub fn broadcaster(&self) -> &Arc<StatusBroadcaster> {
        &self.inner.broadcaster
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// The sync holding the concurrency token in this process.
    pub fn active(&self) -> Option<String> {
        self.inner.guard.active()
    }

    /// Admit a sync and run it on a background task.
    pub async fn start(&self, request: SyncRequest) -> SyncResult<StartedSync> {
        let inner = &self.inner;
        let sync_id = new_sync_id();
        let permit = inner
            .guard
            .try_acquire(&sync_id, inner.store.as_ref())
            .await
            .map_err(|e| self.rejected(e))?;

        let record = SyncRecord::new(
            sync_id.clone(),
            request.direction,
            &request.triggered_by,
            request.dry_run,
        );
        // Another process may have admitted a sync since the check above;
        // the store refuses a second running record.
        inner
            .store
            .create(&record)
            .await
            .map_err(|e| self.rejected(SyncError::from(e)))?;
        inner.broadcaster.publish(&record);
        inner.metrics.record_started(request.direction);

        let cancel = Arc::new(AtomicBool::new(false));
        inner
            .cancels()
            .insert(sync_id.clone(), Arc::clone(&cancel));
        info!(
            sync_id = %sync_id,
            direction = %request.direction,
            dry_run = request.dry_run,
            triggered_by = %request.triggered_by,
            "sync admitted"
        );

        let span = tracing::info_span!("sync", sync_id = %sync_id, direction = %request.direction);
        let run = Run::new(Arc::clone(inner), record.clone(), cancel);
        let handle =
            tokio::spawn(supervise(Arc::clone(inner), record, run, permit).instrument(span));
        Ok(StartedSync { sync_id, handle })
    }

    fn rejected(&self, e: SyncError) -> SyncError {
        if let SyncError::SyncInProgress { ref active_sync_id } = e {
            self.inner.metrics.syncs_rejected.inc();
            warn!(active_sync_id = %active_sync_id, "sync rejected: another sync is running");
        }
        e
    }

    /// Request cancellation. Honored at the next phase boundary.
    pub async fn cancel(&self, sync_id: &str) -> Result<(), CancelError> {
        if let Some(flag) = self.inner.cancels().get(sync_id) {
            flag.store(true, Ordering::SeqCst);
            info!(sync_id, "cancellation requested");
            return Ok(());
        }
        match self.inner.store.get(sync_id).await? {
            None => Err(CancelError::NotFound(sync_id.to_string())),
            Some(r) if r.status.is_terminal() => {
                Err(CancelError::AlreadyFinished(sync_id.to_string(), r.status))
            }
            Some(_) => Err(CancelError::NotOwned(sync_id.to_string())),
        }
    }

    /// Fail every `running` record not owned by a task in this process.
    pub async fn recover_interrupted(&self) -> anyhow::Result<usize> {
        let owned: Vec<String> = self.inner.cancels().keys().cloned().collect();
        recover_interrupted(
            self.inner.store.as_ref(),
            &self.inner.broadcaster,
            |id| owned.iter().any(|o| o == id),
        )
        .await
    }
}

/// Mark `running` records for which `is_owned` is false as `failed` with
/// kind `interrupted`. Returns how many were recovered.
pub async fn recover_interrupted(
    store: &dyn HistoryStore,
    broadcaster: &StatusBroadcaster,
    is_owned: impl Fn(&str) -> bool,
) -> anyhow::Result<usize> {
    let mut recovered = 0;
    for record in store.running().await? {
        if is_owned(&record.sync_id) {
            continue;
        }
        let err = SyncError::Interrupted;
        let completion =
            Completion::failed(err.to_string(), err.details(Some(record.current_phase)));
        if let Some(snapshot) = store.complete(&record.sync_id, &completion).await? {
            broadcaster.publish(&snapshot);
        }
        warn!(
            sync_id = %record.sync_id,
            phase = %record.current_phase,
            "marked interrupted sync as failed"
        );
        recovered += 1;
    }
    Ok(recovered)
}

// ── Per-sync run ────────────────────────────────────────────────

/// Drive `run` to its terminal record. A panic inside the run still fails the
/// record, frees the cancel entry and releases the permit.
async fn supervise(
    ctl: Arc<Inner>,
    admitted: SyncRecord,
    run: Run,
    permit: SyncPermit,
) -> SyncRecord {
    let outcome = AssertUnwindSafe(run.execute()).catch_unwind().await;
    let final_record = match outcome {
        Ok(record) => record,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(panic = %message, "sync task panicked");
            fail_after_panic(&ctl, admitted, &message).await
        }
    };
    ctl.cancels().remove(&final_record.sync_id);
    ctl.metrics.record_finished(
        final_record.direction,
        final_record.status,
        final_record.rows_synced(),
    );
    drop(permit);
    final_record
}

async fn fail_after_panic(ctl: &Inner, admitted: SyncRecord, message: &str) -> SyncRecord {
    let sync_id = admitted.sync_id.clone();
    let last = match ctl.store.get(&sync_id).await {
        Ok(Some(record)) => record,
        Ok(None) => admitted,
        Err(e) => {
            error!(error = %e, "failed to read sync record after panic");
            admitted
        }
    };
    let err = SyncError::Internal(format!("sync task panicked: {}", message));
    let completion = Completion::failed(err.to_string(), err.details(Some(last.current_phase)));
    let mut record = match ctl.store.complete(&sync_id, &completion).await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => {
            error!("sync record vanished from history");
            last
        }
        Err(e) => {
            error!(error = %e, "failed to persist terminal status");
            last
        }
    };
    record.finish(&completion);
    ctl.broadcaster.publish(&record);
    record
}

struct Run {
    ctl: Arc<Inner>,
    record: SyncRecord,
    cancel: Arc<AtomicBool>,
    tables: Vec<String>,
    phase_clock: Option<(SyncPhase, Instant)>,
    artifact: Option<PathBuf>,
    backup: Option<PathBuf>,
    target_touched: bool,
}

impl Run {
    fn new(ctl: Arc<Inner>, record: SyncRecord, cancel: Arc<AtomicBool>) -> Self {
        Run {
            ctl,
            record,
            cancel,
            tables: sync_tables(),
            phase_clock: Some((SyncPhase::Validation, Instant::now())),
            artifact: None,
            backup: None,
            target_touched: false,
        }
    }

    fn sync_id(&self) -> String {
        self.record.sync_id.clone()
    }

    fn source(&self) -> Arc<dyn SyncEndpoint> {
        Arc::clone(self.ctl.endpoints.source(self.record.direction))
    }

    fn target(&self) -> Arc<dyn SyncEndpoint> {
        Arc::clone(self.ctl.endpoints.target(self.record.direction))
    }

    async fn execute(mut self) -> SyncRecord {
        let outcome = self.phases().await;
        self.close_phase_clock();
        let completion = self.settle(outcome).await;
        self.finish(&completion).await
    }

    /// Rollback if needed and decide the terminal status.
    async fn settle(&mut self, outcome: SyncResult<()>) -> Completion {
        let phase = self.record.current_phase;
        let err = match outcome {
            Ok(()) => return Completion::completed(),
            Err(e) => e,
        };
        let wants_rollback = self.target_touched
            && (matches!(err, SyncError::CancelledByUser)
                || matches!(phase, SyncPhase::Preparation | SyncPhase::Import));
        if wants_rollback {
            if let Err(rollback_err) = self.rollback().await {
                let failure = SyncError::RollbackFailure {
                    message: rollback_err.to_string(),
                    cause: err.to_string(),
                };
                error!(phase = %phase, error = %failure, "rollback failed; target state unknown");
                let mut details = failure.details(Some(phase));
                details["backup_file_path"] = serde_json::json!(self.backup);
                return Completion::failed(failure.to_string(), details);
            }
        }
        match err {
            SyncError::CancelledByUser => {
                info!(phase = %phase, "sync cancelled");
                Completion::cancelled()
            }
            err => {
                error!(phase = %phase, kind = err.kind().as_str(), error = %err, "sync failed");
                Completion::failed(err.to_string(), err.details(Some(phase)))
            }
        }
    }

    async fn rollback(&self) -> SyncResult<()> {
        info!(backup = ?self.backup, "rolling back target");
        self.ctl
            .executor
            .rollback(self.target().as_ref(), &self.tables, self.backup.as_deref())
            .await
    }

    async fn finish(&mut self, completion: &Completion) -> SyncRecord {
        self.record.finish(completion);
        match self
            .ctl
            .store
            .complete(&self.record.sync_id, completion)
            .await
        {
            Ok(Some(snapshot)) => self.record = snapshot,
            Ok(None) => error!("sync record vanished from history"),
            Err(e) => error!(error = %e, "failed to persist terminal status"),
        }
        self.ctl.broadcaster.publish(&self.record);
        info!(summary = %self.record.summary(), "sync finished");
        self.record.clone()
    }

    // ── Phase plumbing ──────────────────────────────────────────

    async fn update(&mut self, progress: SyncProgress) -> SyncResult<()> {
        self.record.apply(&progress);
        let snapshot = self
            .ctl
            .store
            .update_progress(&self.record.sync_id, &progress)
            .await?
            .ok_or_else(|| SyncError::Internal("sync record vanished from history".into()))?;
        self.ctl.broadcaster.publish(&snapshot);
        self.record = snapshot;
        Ok(())
    }

    fn close_phase_clock(&mut self) {
        if let Some((phase, started)) = self.phase_clock.take() {
            self.ctl
                .metrics
                .observe_phase(phase, started.elapsed().as_secs_f64());
        }
    }

    async fn enter(&mut self, phase: SyncPhase) -> SyncResult<()> {
        self.close_phase_clock();
        self.phase_clock = Some((phase, Instant::now()));
        info!(phase = %phase, "phase started");
        self.update(SyncProgress::enter(phase)).await
    }

    fn check_cancel(&self) -> SyncResult<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(SyncError::CancelledByUser);
        }
        Ok(())
    }

    // ── Phases ──────────────────────────────────────────────────

    async fn phases(&mut self) -> SyncResult<()> {
        self.validation().await?;
        self.check_cancel()?;
        self.export().await?;
        if self.record.dry_run {
            info!("dry run: skipping preparation and import");
            return Ok(());
        }
        self.check_cancel()?;
        self.preparation().await?;
        self.check_cancel()?;
        self.import().await?;
        self.check_cancel()?;
        if self.record.direction == Direction::RemoteToLocal {
            self.indexing().await?;
            self.check_cancel()?;
        }
        self.verification().await
    }

    async fn validation(&mut self) -> SyncResult<()> {
        let report = self.ctl.validator.validate(self.record.direction).await;
        let warnings = report.warnings.iter().map(|w| w.to_string()).collect();
        self.update(SyncProgress {
            percent: Some(SyncPhase::Validation.end_percent()),
            warnings,
            ..Default::default()
        })
        .await?;
        match report.into_fatal() {
            Some(fatal) => Err(fatal),
            None => Ok(()),
        }
    }

    async fn export(&mut self) -> SyncResult<()> {
        self.enter(SyncPhase::Export).await?;
        let source = self.source();
        let target = self.target();

        let mut total_rows = 0;
        for table in source.existing_tables(&self.tables).await? {
            total_rows += source.row_count(&table).await?;
        }
        self.update(SyncProgress {
            total_rows: Some(total_rows),
            ..Default::default()
        })
        .await?;

        let outcome = self
            .ctl
            .executor
            .export(&self.sync_id(), source.as_ref(), target.as_ref(), &self.tables)
            .await?;
        info!(
            mode = outcome.mode.as_str(),
            size_bytes = outcome.size_bytes,
            duration_ms = outcome.duration.as_millis() as u64,
            "export finished"
        );
        self.artifact = Some(outcome.artifact_path.clone());
        self.update(SyncProgress {
            percent: Some(SyncPhase::Export.end_percent()),
            export_mode: Some(outcome.mode),
            export_size: Some(outcome.size_bytes as i64),
            export_duration_ms: Some(outcome.duration.as_millis() as i64),
            artifact_path: Some(outcome.artifact_path.display().to_string()),
            artifact_checksum: Some(outcome.checksum),
            ..Default::default()
        })
        .await
    }

    async fn preparation(&mut self) -> SyncResult<()> {
        self.enter(SyncPhase::Preparation).await?;
        let target = self.target();
        self.backup = self
            .ctl
            .executor
            .backup(&self.sync_id(), target.as_ref(), &self.tables)
            .await?;
        if let Some(ref path) = self.backup {
            self.update(SyncProgress {
                backup_file_path: Some(path.display().to_string()),
                ..Default::default()
            })
            .await?;
        }
        self.target_touched = true;
        prepare(target.as_ref(), &self.tables).await?;
        Ok(())
    }

    async fn import(&mut self) -> SyncResult<()> {
        self.enter(SyncPhase::Import).await?;
        let artifact = self
            .artifact
            .clone()
            .ok_or_else(|| SyncError::Internal("import without an export artifact".into()))?;

        let executor = self.ctl.executor.clone();
        let target = self.target();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let import = async move { executor.import(target.as_ref(), &artifact, tx).await };
        tokio::pin!(import);

        let mut last = Instant::now();
        let outcome = loop {
            tokio::select! {
                res = &mut import => break res,
                Some(loaded) = rx.recv() => self.table_loaded(loaded, &mut last).await?,
            }
        };
        while let Ok(loaded) = rx.try_recv() {
            self.table_loaded(loaded, &mut last).await?;
        }
        let outcome = outcome?;

        self.update(SyncProgress {
            percent: Some(SyncPhase::Import.end_percent()),
            current_table: Some(None),
            import_duration_ms: Some(outcome.duration.as_millis() as i64),
            ..Default::default()
        })
        .await
    }

    async fn table_loaded(&mut self, loaded: TableLoaded, last: &mut Instant) -> SyncResult<()> {
        let now = Instant::now();
        let duration_ms = now.duration_since(*last).as_millis() as i64;
        *last = now;
        let synced = self.record.synced_rows + loaded.row_count;
        info!(table = %loaded.table_name, rows = loaded.row_count, "table loaded");
        self.update(SyncProgress {
            percent: Some(SyncPhase::Import.percent_at(synced, self.record.total_rows)),
            current_table: Some(Some(loaded.table_name.clone())),
            synced_rows: Some(synced),
            tables_synced: vec![TableSync {
                table_name: loaded.table_name,
                row_count: loaded.row_count,
                duration_ms,
            }],
            ..Default::default()
        })
        .await
    }

    /// Index rebuild failures are recorded as warnings; verification still
    /// runs.
    async fn indexing(&mut self) -> SyncResult<()> {
        self.enter(SyncPhase::Indexing).await?;
        let target = self.target();
        let heavy: Vec<String> = self
            .ctl
            .config
            .heavy_index_tables
            .iter()
            .filter(|t| self.tables.contains(t))
            .cloned()
            .collect();
        let present = target.existing_tables(&heavy).await?;
        let started = Instant::now();
        let mut warnings = Vec::new();
        if let Err(e) = target.rebuild_indexes(&present).await {
            warn!(error = %e, "index rebuild failed");
            warnings.push(format!("index rebuild failed: {:#}", e));
        }
        self.update(SyncProgress {
            percent: Some(SyncPhase::Indexing.end_percent()),
            indexing_duration_ms: Some(started.elapsed().as_millis() as i64),
            warnings,
            ..Default::default()
        })
        .await
    }

    async fn verification(&mut self) -> SyncResult<()> {
        self.enter(SyncPhase::Verification).await?;
        let results = verify(self.source().as_ref(), self.target().as_ref(), &self.tables).await?;
        let diverged = mismatched(&results);
        let mut warnings = Vec::new();
        if !diverged.is_empty() {
            let mismatch = SyncError::VerificationMismatch { tables: diverged };
            warn!(error = %mismatch, "verification mismatch");
            warnings.push(mismatch.to_string());
        }
        self.update(SyncProgress {
            percent: Some(SyncPhase::Verification.end_percent()),
            verification_passed: Some(warnings.is_empty()),
            verification_results: Some(results),
            warnings,
            ..Default::default()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn finished(status: SyncStatus) -> SyncRecord {
        let mut r = SyncRecord::new("s".into(), Direction::LocalToRemote, "t", false);
        r.status = status;
        r
    }

    #[test]
    fn exit_code_for_terminal_records() {
        let mut ok = finished(SyncStatus::Completed);
        ok.verification_passed = Some(true);
        assert_eq!(exit_code_for(&ok), 0);

        let mut mismatch = finished(SyncStatus::Completed);
        mismatch.verification_passed = Some(false);
        assert_eq!(exit_code_for(&mismatch), 4);

        assert_eq!(exit_code_for(&finished(SyncStatus::Cancelled)), 5);

        let mut conn = finished(SyncStatus::Failed);
        conn.error_details = Some(json!({"kind": "connection_error"}));
        assert_eq!(exit_code_for(&conn), 2);

        let mut import = finished(SyncStatus::Failed);
        import.error_details = Some(json!({"kind": "import_failure"}));
        assert_eq!(exit_code_for(&import), 3);

        let mut unknown = finished(SyncStatus::Failed);
        unknown.error_details = Some(json!({"kind": "mystery"}));
        assert_eq!(exit_code_for(&unknown), 1);
    }
}
