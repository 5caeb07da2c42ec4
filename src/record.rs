//! # Record — Sync Attempt State
//!
//! `SyncRecord` is the single typed state of one sync attempt. The controller
//! owns mutation; the history store persists it; the broadcaster mirrors it.
//!
//! ## Mutation rules
//!
//! - [`SyncRecord::apply`] merges a [`SyncProgress`] delta. It silently rejects
//!   phase or percent regressions (stale deliveries) and anything arriving
//!   after a terminal status.
//! - [`SyncRecord::finish`] writes the terminal status exactly once. Only
//!   `completed` forces `percent_complete` to 100; while running the percent
//!   is capped at 99.
//! - Phase metrics (`export_size`, durations, artifact paths) are set once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Highest percent a running sync may report.
pub const RUNNING_PERCENT_CAP: i32 = 99;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Local => "local",
            Side::Remote => "remote",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which database is the source of truth for a sync.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

impl Direction {
    pub fn source(self) -> Side {
        match self {
            Direction::LocalToRemote => Side::Local,
            Direction::RemoteToLocal => Side::Remote,
        }
    }

    pub fn target(self) -> Side {
        match self {
            Direction::LocalToRemote => Side::Remote,
            Direction::RemoteToLocal => Side::Local,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::LocalToRemote => "local_to_remote",
            Direction::RemoteToLocal => "remote_to_local",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local_to_remote" => Ok(Direction::LocalToRemote),
            "remote_to_local" => Ok(Direction::RemoteToLocal),
            other => Err(format!(
                "invalid direction '{}' (expected local_to_remote or remote_to_local)",
                other
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SyncStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SyncStatus::Running),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            "cancelled" => Ok(SyncStatus::Cancelled),
            other => Err(format!("invalid status '{}'", other)),
        }
    }
}

/// Sync state machine phases, declared in execution order so `Ord` follows it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Validation,
    Export,
    Preparation,
    Import,
    Indexing,
    Verification,
}

impl SyncPhase {
    pub const ALL: [SyncPhase; 6] = [
        SyncPhase::Validation,
        SyncPhase::Export,
        SyncPhase::Preparation,
        SyncPhase::Import,
        SyncPhase::Indexing,
        SyncPhase::Verification,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SyncPhase::Validation => "validation",
            SyncPhase::Export => "export",
            SyncPhase::Preparation => "preparation",
            SyncPhase::Import => "import",
            SyncPhase::Indexing => "indexing",
            SyncPhase::Verification => "verification",
        }
    }

    /// Percent reported when the phase begins.
    pub fn start_percent(self) -> i32 {
        match self {
            SyncPhase::Validation => 0,
            SyncPhase::Export => 5,
            SyncPhase::Preparation => 35,
            SyncPhase::Import => 40,
            SyncPhase::Indexing => 80,
            SyncPhase::Verification => 88,
        }
    }

    /// Percent reported when the phase ends (the next phase's start).
    pub fn end_percent(self) -> i32 {
        match self {
            SyncPhase::Verification => RUNNING_PERCENT_CAP,
            other => {
                let next = SyncPhase::ALL[other as usize + 1];
                next.start_percent()
            }
        }
    }

    /// Interpolate within this phase's band, `done` out of `total` units.
    pub fn percent_at(self, done: i64, total: i64) -> i32 {
        let start = self.start_percent();
        let end = self.end_percent();
        if total <= 0 {
            return start;
        }
        let frac = (done.clamp(0, total) as f64) / (total as f64);
        start + ((end - start) as f64 * frac).floor() as i32
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncPhase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("invalid phase '{}'", s))
    }
}

/// Kind of artifact requested from the dump tool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    /// Schema + data, for a target with no existing tables.
    Full,
    /// Data only, for a target whose schema already exists.
    DataOnly,
}

impl ExportMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportMode::Full => "full",
            ExportMode::DataOnly => "data_only",
        }
    }
}

impl FromStr for ExportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(ExportMode::Full),
            "data_only" => Ok(ExportMode::DataOnly),
            other => Err(format!("invalid export mode '{}'", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableSync {
    pub table_name: String,
    pub row_count: i64,
    pub duration_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub table_name: String,
    pub source_count: i64,
    pub target_count: i64,
    pub matched: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub sync_id: String,
    pub direction: Direction,
    pub status: SyncStatus,
    pub current_phase: SyncPhase,
    pub percent_complete: i32,
    pub current_table: Option<String>,
    pub synced_rows: i64,
    pub total_rows: i64,
    pub tables_synced: Vec<TableSync>,
    pub verification_results: Option<Vec<VerificationResult>>,
    pub verification_passed: Option<bool>,
    pub export_mode: Option<ExportMode>,
    pub export_size: Option<i64>,
    pub export_duration_ms: Option<i64>,
    pub import_duration_ms: Option<i64>,
    pub indexing_duration_ms: Option<i64>,
    pub artifact_path: Option<String>,
    pub artifact_checksum: Option<String>,
    pub backup_file_path: Option<String>,
    pub warnings: Vec<String>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub dry_run: bool,
    pub triggered_by: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// Partial update produced by the controller. `None` fields are untouched;
/// `tables_synced` and `warnings` append.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncProgress {
    pub phase: Option<SyncPhase>,
    pub percent: Option<i32>,
    /// `Some(None)` clears the current table.
    pub current_table: Option<Option<String>>,
    pub synced_rows: Option<i64>,
    pub total_rows: Option<i64>,
    pub tables_synced: Vec<TableSync>,
    pub verification_results: Option<Vec<VerificationResult>>,
    pub verification_passed: Option<bool>,
    pub export_mode: Option<ExportMode>,
    pub export_size: Option<i64>,
    pub export_duration_ms: Option<i64>,
    pub import_duration_ms: Option<i64>,
    pub indexing_duration_ms: Option<i64>,
    pub artifact_path: Option<String>,
    pub artifact_checksum: Option<String>,
    pub backup_file_path: Option<String>,
    pub warnings: Vec<String>,
}

impl SyncProgress {
    /// Enter `phase` at its starting percent, clearing the per-table cursor.
    pub fn enter(phase: SyncPhase) -> Self {
        SyncProgress {
            phase: Some(phase),
            percent: Some(phase.start_percent()),
            current_table: Some(None),
            ..Default::default()
        }
    }
}

/// Terminal transition request.
#[derive(Clone, Debug)]
pub struct Completion {
    pub status: SyncStatus,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub completed_at: DateTime<Utc>,
}

impl Completion {
    pub fn completed() -> Self {
        Completion {
            status: SyncStatus::Completed,
            error_message: None,
            error_details: None,
            completed_at: Utc::now(),
        }
    }

    pub fn cancelled() -> Self {
        Completion {
            status: SyncStatus::Cancelled,
            error_message: None,
            error_details: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(message: String, details: serde_json::Value) -> Self {
        Completion {
            status: SyncStatus::Failed,
            error_message: Some(message),
            error_details: Some(details),
            completed_at: Utc::now(),
        }
    }
}

fn set_once<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        if let Some(v) = value {
            *slot = Some(v);
        }
    }
}

impl SyncRecord {
    /// A freshly admitted sync: running, in validation, at 0%.
    pub fn new(sync_id: String, direction: Direction, triggered_by: &str, dry_run: bool) -> Self {
        SyncRecord {
            sync_id,
            direction,
            status: SyncStatus::Running,
            current_phase: SyncPhase::Validation,
            percent_complete: 0,
            current_table: None,
            synced_rows: 0,
            total_rows: 0,
            tables_synced: Vec::new(),
            verification_results: None,
            verification_passed: None,
            export_mode: None,
            export_size: None,
            export_duration_ms: None,
            import_duration_ms: None,
            indexing_duration_ms: None,
            artifact_path: None,
            artifact_checksum: None,
            backup_file_path: None,
            warnings: Vec::new(),
            error_message: None,
            error_details: None,
            dry_run,
            triggered_by: triggered_by.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        }
    }

    /// Merge a progress delta. Returns false if the delta was rejected.
    pub fn apply(&mut self, progress: &SyncProgress) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if let Some(phase) = progress.phase {
            if phase < self.current_phase {
                return false;
            }
        }
        if let Some(percent) = progress.percent {
            if percent < self.percent_complete {
                return false;
            }
        }

        if let Some(phase) = progress.phase {
            self.current_phase = phase;
        }
        if let Some(percent) = progress.percent {
            self.percent_complete = percent.min(RUNNING_PERCENT_CAP);
        }
        if let Some(ref table) = progress.current_table {
            self.current_table = table.clone();
        }
        if let Some(rows) = progress.synced_rows {
            self.synced_rows = rows;
        }
        if let Some(rows) = progress.total_rows {
            self.total_rows = rows;
        }
        self.tables_synced
            .extend(progress.tables_synced.iter().cloned());
        set_once(
            &mut self.verification_results,
            progress.verification_results.clone(),
        );
        set_once(&mut self.verification_passed, progress.verification_passed);
        set_once(&mut self.export_mode, progress.export_mode);
        set_once(&mut self.export_size, progress.export_size);
        set_once(&mut self.export_duration_ms, progress.export_duration_ms);
        set_once(&mut self.import_duration_ms, progress.import_duration_ms);
        set_once(&mut self.indexing_duration_ms, progress.indexing_duration_ms);
        set_once(&mut self.artifact_path, progress.artifact_path.clone());
        set_once(&mut self.artifact_checksum, progress.artifact_checksum.clone());
        set_once(&mut self.backup_file_path, progress.backup_file_path.clone());
        self.warnings.extend(progress.warnings.iter().cloned());
        true
    }

    /// Write the terminal status. Returns false if already terminal.
    pub fn finish(&mut self, completion: &Completion) -> bool {
        if self.status.is_terminal() || !completion.status.is_terminal() {
            return false;
        }
        self.status = completion.status;
        if completion.status == SyncStatus::Completed {
            self.percent_complete = 100;
        }
        if completion.status == SyncStatus::Failed {
            self.error_message = completion.error_message.clone();
            self.error_details = completion.error_details.clone();
        }
        self.current_table = None;
        self.completed_at = Some(completion.completed_at);
        self.duration_ms = Some(
            (completion.completed_at - self.started_at)
                .num_milliseconds()
                .max(0),
        );
        true
    }

    pub fn rows_synced(&self) -> i64 {
        self.tables_synced.iter().map(|t| t.row_count).sum()
    }

    /// Human-readable outcome, enough to decide whether manual intervention
    /// is needed.
    pub fn summary(&self) -> String {
        let secs = self.duration_ms.unwrap_or(0) as f64 / 1000.0;
        let verification = match &self.verification_results {
            Some(results) => {
                let passed = results.iter().filter(|r| r.matched).count();
                let failed: Vec<&str> = results
                    .iter()
                    .filter(|r| !r.matched)
                    .map(|r| r.table_name.as_str())
                    .collect();
                if failed.is_empty() {
                    format!("verification {}/{} tables matched", passed, results.len())
                } else {
                    format!(
                        "verification {}/{} tables matched, mismatched: {}",
                        passed,
                        results.len(),
                        failed.join(", ")
                    )
                }
            }
            None => "verification not run".to_string(),
        };
        let outcome = match self.status {
            SyncStatus::Running => format!(
                "running ({}, {}%)",
                self.current_phase, self.percent_complete
            ),
            SyncStatus::Completed if self.dry_run => "dry run completed".to_string(),
            SyncStatus::Completed if self.verification_passed == Some(false) => {
                "completed with verification mismatches".to_string()
            }
            SyncStatus::Completed => "completed".to_string(),
            SyncStatus::Cancelled => format!("cancelled during {}", self.current_phase),
            SyncStatus::Failed => format!(
                "failed during {}: {}",
                self.current_phase,
                self.error_message.as_deref().unwrap_or("unknown error")
            ),
        };
        let mut summary = format!(
            "{} sync {} {} in {:.1}s; {} tables, {} rows synced; {}",
            self.direction,
            self.sync_id,
            outcome,
            secs,
            self.tables_synced.len(),
            self.rows_synced(),
            verification
        );
        if !self.warnings.is_empty() {
            summary.push_str(&format!("; warnings: {}", self.warnings.join("; ")));
        }
        summary
    }
}

/// Time-derived, unique sync identity: `sync_YYYYmmddTHHMMSS_<8 hex>`.
pub fn new_sync_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "sync_{}_{}",
        Utc::now().format("%Y%m%dT%H%M%S"),
        &uuid[..8]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SyncRecord {
        SyncRecord::new("sync_test".into(), Direction::LocalToRemote, "tester", false)
    }

    // ── Direction mapping ─────────────────────────────────────────

    #[test]
    fn direction_maps_source_and_target() {
        assert_eq!(Direction::LocalToRemote.source(), Side::Local);
        assert_eq!(Direction::LocalToRemote.target(), Side::Remote);
        assert_eq!(Direction::RemoteToLocal.source(), Side::Remote);
        assert_eq!(Direction::RemoteToLocal.target(), Side::Local);
    }

    #[test]
    fn direction_parses_wire_names() {
        assert_eq!(
            "remote_to_local".parse::<Direction>().unwrap(),
            Direction::RemoteToLocal
        );
        assert!("sideways".parse::<Direction>().is_err());
        let json = serde_json::to_value(Direction::LocalToRemote).unwrap();
        assert_eq!(json, "local_to_remote");
    }

    // ── Phase ordering and percent bands ──────────────────────────

    #[test]
    fn phases_are_ordered_and_bands_increase() {
        for pair in SyncPhase::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].start_percent() < pair[1].start_percent());
            assert_eq!(pair[0].end_percent(), pair[1].start_percent());
        }
        assert_eq!(SyncPhase::Verification.end_percent(), RUNNING_PERCENT_CAP);
    }

    #[test]
    fn percent_at_interpolates_within_band() {
        assert_eq!(SyncPhase::Import.percent_at(0, 100), 40);
        assert_eq!(SyncPhase::Import.percent_at(50, 100), 60);
        assert_eq!(SyncPhase::Import.percent_at(100, 100), 80);
        assert_eq!(SyncPhase::Import.percent_at(500, 100), 80);
        assert_eq!(SyncPhase::Import.percent_at(5, 0), 40);
    }

    #[test]
    fn phase_round_trips_through_str() {
        for phase in SyncPhase::ALL {
            assert_eq!(phase.as_str().parse::<SyncPhase>().unwrap(), phase);
        }
    }

    // ── Monotonic progress ────────────────────────────────────────

    #[test]
    fn apply_advances_phase_and_percent() {
        let mut r = record();
        assert!(r.apply(&SyncProgress::enter(SyncPhase::Export)));
        assert_eq!(r.current_phase, SyncPhase::Export);
        assert_eq!(r.percent_complete, 5);
    }

    #[test]
    fn apply_rejects_phase_regression() {
        let mut r = record();
        r.apply(&SyncProgress::enter(SyncPhase::Import));
        let stale = SyncProgress::enter(SyncPhase::Export);
        assert!(!r.apply(&stale));
        assert_eq!(r.current_phase, SyncPhase::Import);
        assert_eq!(r.percent_complete, 40);
    }

    #[test]
    fn apply_rejects_percent_regression() {
        let mut r = record();
        r.apply(&SyncProgress {
            percent: Some(30),
            ..Default::default()
        });
        assert!(!r.apply(&SyncProgress {
            percent: Some(10),
            synced_rows: Some(99),
            ..Default::default()
        }));
        assert_eq!(r.percent_complete, 30);
        assert_eq!(r.synced_rows, 0);
    }

    #[test]
    fn running_percent_is_capped_below_100() {
        let mut r = record();
        r.apply(&SyncProgress {
            percent: Some(100),
            ..Default::default()
        });
        assert_eq!(r.percent_complete, RUNNING_PERCENT_CAP);
    }

    #[test]
    fn metrics_are_set_once() {
        let mut r = record();
        r.apply(&SyncProgress {
            export_size: Some(100),
            ..Default::default()
        });
        r.apply(&SyncProgress {
            export_size: Some(999),
            ..Default::default()
        });
        assert_eq!(r.export_size, Some(100));
    }

    #[test]
    fn tables_synced_append_in_order() {
        let mut r = record();
        for (name, rows) in [("users", 3), ("projects", 5)] {
            r.apply(&SyncProgress {
                tables_synced: vec![TableSync {
                    table_name: name.into(),
                    row_count: rows,
                    duration_ms: 1,
                }],
                ..Default::default()
            });
        }
        let names: Vec<_> = r.tables_synced.iter().map(|t| t.table_name.as_str()).collect();
        assert_eq!(names, ["users", "projects"]);
        assert_eq!(r.rows_synced(), 8);
    }

    // ── Terminal transitions ──────────────────────────────────────

    #[test]
    fn completed_forces_percent_100() {
        let mut r = record();
        r.apply(&SyncProgress::enter(SyncPhase::Verification));
        assert!(r.finish(&Completion::completed()));
        assert_eq!(r.status, SyncStatus::Completed);
        assert_eq!(r.percent_complete, 100);
        assert!(r.duration_ms.is_some());
        assert!(r.error_message.is_none());
    }

    #[test]
    fn failed_keeps_phase_and_percent() {
        let mut r = record();
        r.apply(&SyncProgress::enter(SyncPhase::Import));
        let done = Completion::failed("psql exited 3".into(), serde_json::json!({"kind": "import_failure"}));
        assert!(r.finish(&done));
        assert_eq!(r.current_phase, SyncPhase::Import);
        assert_eq!(r.percent_complete, 40);
        assert_eq!(r.error_message.as_deref(), Some("psql exited 3"));
    }

    #[test]
    fn terminal_status_is_written_once() {
        let mut r = record();
        assert!(r.finish(&Completion::cancelled()));
        assert!(!r.finish(&Completion::completed()));
        assert_eq!(r.status, SyncStatus::Cancelled);
        assert!(!r.apply(&SyncProgress::enter(SyncPhase::Export)));
        assert!(r.error_message.is_none());
    }

    #[test]
    fn finish_requires_terminal_status() {
        let mut r = record();
        let bogus = Completion {
            status: SyncStatus::Running,
            ..Completion::completed()
        };
        assert!(!r.finish(&bogus));
    }

    // ── Summary ───────────────────────────────────────────────────

    #[test]
    fn summary_lists_mismatched_tables() {
        let mut r = record();
        r.apply(&SyncProgress {
            verification_results: Some(vec![
                VerificationResult {
                    table_name: "users".into(),
                    source_count: 2,
                    target_count: 2,
                    matched: true,
                },
                VerificationResult {
                    table_name: "comments".into(),
                    source_count: 9,
                    target_count: 8,
                    matched: false,
                },
            ]),
            verification_passed: Some(false),
            ..Default::default()
        });
        r.finish(&Completion::completed());
        let s = r.summary();
        assert!(s.contains("completed with verification mismatches"));
        assert!(s.contains("1/2 tables matched"));
        assert!(s.contains("comments"));
        assert!(s.contains("local_to_remote"));
    }

    #[test]
    fn summary_for_failure_names_phase_and_error() {
        let mut r = record();
        r.apply(&SyncProgress::enter(SyncPhase::Export));
        r.finish(&Completion::failed("pg_dump exited 1".into(), serde_json::json!({})));
        let s = r.summary();
        assert!(s.contains("failed during export: pg_dump exited 1"));
        assert!(s.contains("verification not run"));
    }

    #[test]
    fn sync_ids_are_unique_and_time_prefixed() {
        let a = new_sync_id();
        let b = new_sync_id();
        assert_ne!(a, b);
        assert!(a.starts_with("sync_"));
    }
}
