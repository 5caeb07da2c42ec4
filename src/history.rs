//! # History — Durable Record of Every Sync Attempt
//!
//! The [`HistoryStore`] is the single source of truth for sync state. Polling
//! clients read it directly; the broadcaster only mirrors what was written
//! here. Records are never deleted.
//!
//! Two implementations:
//!
//! - `crate::db::Database` — PostgreSQL `sync_history` table (production).
//! - [`MemoryHistoryStore`] — process-local map, used when no history database
//!   is configured and in tests.
//!
//! Both apply progress through [`SyncRecord::apply`] / [`SyncRecord::finish`],
//! so monotonic enforcement is identical: regressions are dropped silently.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::SyncError;
use crate::record::{Completion, Direction, SyncProgress, SyncRecord, SyncStatus};

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Insert a new record. A `running` record while another is still
    /// running fails with `SyncError::SyncInProgress`.
    async fn create(&self, record: &SyncRecord) -> Result<()>;

    /// Merge `progress` into the record and return the resulting snapshot.
    /// A rejected (stale) update returns the unchanged snapshot.
    async fn update_progress(
        &self,
        sync_id: &str,
        progress: &SyncProgress,
    ) -> Result<Option<SyncRecord>>;

    /// Write the terminal status. Returns the snapshot; a second completion
    /// leaves the first in place.
    async fn complete(&self, sync_id: &str, completion: &Completion)
        -> Result<Option<SyncRecord>>;

    async fn get(&self, sync_id: &str) -> Result<Option<SyncRecord>>;

    async fn list(&self, filter: &HistoryFilter) -> Result<HistoryPage>;

    async fn stats(&self, window_days: i64) -> Result<HistoryStats>;

    /// Records still marked running.
    async fn running(&self) -> Result<Vec<SyncRecord>>;

    async fn health_check(&self) -> Result<()>;
}

// ── Filtering and paging ────────────────────────────────────────

pub const DEFAULT_PER_PAGE: u32 = 25;
pub const MAX_PER_PAGE: u32 = 500;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct HistoryFilter {
    pub direction: Option<Direction>,
    pub status: Option<SyncStatus>,
    pub sort_by: Option<String>,
    pub sort_dir: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl HistoryFilter {
    /// Whitelist sort column to prevent SQL injection.
    /// Unknown values default to "started_at".
    pub fn safe_sort_column(&self) -> &'static str {
        match self.sort_by.as_deref() {
            Some("completed_at") => "completed_at",
            Some("duration_ms") => "duration_ms",
            Some("direction") => "direction",
            Some("status") => "status",
            _ => "started_at",
        }
    }

    /// Only "asc"/"ASC" are accepted; everything else is "DESC".
    pub fn safe_sort_dir(&self) -> &'static str {
        match self.sort_dir.as_deref() {
            Some("asc") | Some("ASC") => "ASC",
            _ => "DESC",
        }
    }

    /// 1-based page number.
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn per_page(&self) -> u32 {
        self.per_page
            .unwrap_or(DEFAULT_PER_PAGE)
            .clamp(1, MAX_PER_PAGE)
    }

    pub fn offset(&self) -> u64 {
        (self.page() as u64 - 1) * self.per_page() as u64
    }

    pub fn matches(&self, record: &SyncRecord) -> bool {
        self.direction.is_none_or(|d| record.direction == d)
            && self.status.is_none_or(|s| record.status == s)
    }

    fn compare(&self, a: &SyncRecord, b: &SyncRecord) -> std::cmp::Ordering {
        let ord = match self.safe_sort_column() {
            "completed_at" => a.completed_at.cmp(&b.completed_at),
            "duration_ms" => a.duration_ms.cmp(&b.duration_ms),
            "direction" => a.direction.as_str().cmp(b.direction.as_str()),
            "status" => a.status.as_str().cmp(b.status.as_str()),
            _ => a.started_at.cmp(&b.started_at),
        }
        .then_with(|| a.sync_id.cmp(&b.sync_id));
        if self.safe_sort_dir() == "ASC" {
            ord
        } else {
            ord.reverse()
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HistoryPage {
    pub records: Vec<SyncRecord>,
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
}

// ── Stats ───────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectionStats {
    pub direction: String,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub window_days: i64,
    pub total: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    /// Completed syncs whose verification found diverging tables.
    pub verification_mismatches: i64,
    pub avg_completed_duration_ms: Option<f64>,
    pub by_direction: Vec<DirectionStats>,
}

impl HistoryStats {
    /// Aggregate records started within the window ending now.
    pub fn from_records<'a>(
        window_days: i64,
        records: impl IntoIterator<Item = &'a SyncRecord>,
    ) -> Self {
        let since = Utc::now() - chrono::Duration::days(window_days);
        let mut stats = HistoryStats {
            window_days,
            ..Default::default()
        };
        let mut durations = Vec::new();
        let mut by_direction: BTreeMap<&'static str, DirectionStats> = BTreeMap::new();
        for r in records.into_iter().filter(|r| r.started_at >= since) {
            stats.total += 1;
            let dir = by_direction
                .entry(r.direction.as_str())
                .or_insert_with(|| DirectionStats {
                    direction: r.direction.as_str().to_string(),
                    ..Default::default()
                });
            dir.total += 1;
            match r.status {
                SyncStatus::Running => stats.running += 1,
                SyncStatus::Completed => {
                    stats.completed += 1;
                    dir.completed += 1;
                    if r.verification_passed == Some(false) {
                        stats.verification_mismatches += 1;
                    }
                    if let Some(d) = r.duration_ms {
                        durations.push(d as f64);
                    }
                    if !r.dry_run && r.completed_at > dir.last_success_at {
                        dir.last_success_at = r.completed_at;
                    }
                }
                SyncStatus::Failed => {
                    stats.failed += 1;
                    dir.failed += 1;
                }
                SyncStatus::Cancelled => stats.cancelled += 1,
            }
        }
        if !durations.is_empty() {
            stats.avg_completed_duration_ms =
                Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
        stats.by_direction = by_direction.into_values().collect();
        stats
    }
}

// ── CSV export ──────────────────────────────────────────────────

fn csv_field(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Render records as CSV, one row per sync attempt.
pub fn to_csv(records: &[SyncRecord]) -> String {
    let mut csv = String::from(
        "sync_id,direction,status,current_phase,percent_complete,tables_synced,rows_synced,\
         verification_passed,export_size,started_at,completed_at,duration_ms,triggered_by,error_message\n",
    );
    for r in records {
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{}\n",
            csv_field(&r.sync_id),
            r.direction,
            r.status,
            r.current_phase,
            r.percent_complete,
            r.tables_synced.len(),
            r.rows_synced(),
            r.verification_passed
                .map(|v| v.to_string())
                .unwrap_or_default(),
            r.export_size.map(|v| v.to_string()).unwrap_or_default(),
            r.started_at.to_rfc3339(),
            r.completed_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            r.duration_ms.map(|v| v.to_string()).unwrap_or_default(),
            csv_field(&r.triggered_by),
            csv_field(r.error_message.as_deref().unwrap_or("")),
        ));
    }
    csv
}

// ── In-memory store ─────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryHistoryStore {
    records: RwLock<BTreeMap<String, SyncRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, SyncRecord>> {
        self.records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, SyncRecord>> {
        self.records
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn create(&self, record: &SyncRecord) -> Result<()> {
        let mut records = self.write();
        if records.contains_key(&record.sync_id) {
            anyhow::bail!("sync {} already exists", record.sync_id);
        }
        if record.status == SyncStatus::Running {
            if let Some(active) = records.values().find(|r| r.status == SyncStatus::Running) {
                return Err(SyncError::SyncInProgress {
                    active_sync_id: active.sync_id.clone(),
                }
                .into());
            }
        }
        records.insert(record.sync_id.clone(), record.clone());
        Ok(())
    }

    async fn update_progress(
        &self,
        sync_id: &str,
        progress: &SyncProgress,
    ) -> Result<Option<SyncRecord>> {
        let mut records = self.write();
        Ok(records.get_mut(sync_id).map(|r| {
            r.apply(progress);
            r.clone()
        }))
    }

    async fn complete(
        &self,
        sync_id: &str,
        completion: &Completion,
    ) -> Result<Option<SyncRecord>> {
        let mut records = self.write();
        Ok(records.get_mut(sync_id).map(|r| {
            r.finish(completion);
            r.clone()
        }))
    }

    async fn get(&self, sync_id: &str) -> Result<Option<SyncRecord>> {
        Ok(self.read().get(sync_id).cloned())
    }

    async fn list(&self, filter: &HistoryFilter) -> Result<HistoryPage> {
        let mut matching: Vec<SyncRecord> = self
            .read()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        matching.sort_by(|a, b| filter.compare(a, b));
        let total = matching.len() as i64;
        let records = matching
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.per_page() as usize)
            .collect();
        Ok(HistoryPage {
            records,
            total,
            page: filter.page(),
            per_page: filter.per_page(),
        })
    }

    async fn stats(&self, window_days: i64) -> Result<HistoryStats> {
        Ok(HistoryStats::from_records(window_days, self.read().values()))
    }

    async fn running(&self) -> Result<Vec<SyncRecord>> {
        Ok(self
            .read()
            .values()
            .filter(|r| r.status == SyncStatus::Running)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
