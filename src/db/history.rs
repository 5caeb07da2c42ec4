//! `sync_history` persistence.
//!
//! Updates are read-modify-write under `SELECT ... FOR UPDATE` so the
//! monotonic merge rules in `SyncRecord::apply` hold even with several
//! writers (a crashed process's recovery pass racing a new server).

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Database, SyncHistoryRow};
use crate::error::SyncError;
use crate::history::{DirectionStats, HistoryFilter, HistoryPage, HistoryStats, HistoryStore};
use crate::record::{Completion, SyncProgress, SyncRecord};

const COLUMNS: &str = "sync_id, direction, status, current_phase, percent_complete, current_table,
    synced_rows, total_rows, tables_synced, verification_results, verification_passed,
    export_mode, export_size, export_duration_ms, import_duration_ms, indexing_duration_ms,
    artifact_path, artifact_checksum, backup_file_path, warnings, error_message, error_details,
    dry_run, triggered_by, started_at, completed_at, duration_ms";

/// Partial unique index admitting one `running` row.
const ONE_RUNNING_INDEX: &str = "idx_sync_history_one_running";

fn json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

impl Database {
    async fn lock_record(
        tx: &mut Transaction<'_, Postgres>,
        sync_id: &str,
    ) -> Result<Option<SyncRecord>> {
        let row: Option<SyncHistoryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sync_history WHERE sync_id = $1 FOR UPDATE",
            COLUMNS
        ))
        .bind(sync_id)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(SyncRecord::try_from).transpose()
    }

    async fn store_record(tx: &mut Transaction<'_, Postgres>, r: &SyncRecord) -> Result<()> {
        sqlx::query(
            "UPDATE sync_history SET
                status = $2, current_phase = $3, percent_complete = $4, current_table = $5,
                synced_rows = $6, total_rows = $7, tables_synced = $8,
                verification_results = $9, verification_passed = $10, export_mode = $11,
                export_size = $12, export_duration_ms = $13, import_duration_ms = $14,
                indexing_duration_ms = $15, artifact_path = $16, artifact_checksum = $17,
                backup_file_path = $18, warnings = $19, error_message = $20,
                error_details = $21, completed_at = $22, duration_ms = $23
             WHERE sync_id = $1",
        )
        .bind(&r.sync_id)
        .bind(r.status.as_str())
        .bind(r.current_phase.as_str())
        .bind(r.percent_complete)
        .bind(&r.current_table)
        .bind(r.synced_rows)
        .bind(r.total_rows)
        .bind(json(&r.tables_synced)?)
        .bind(r.verification_results.as_ref().map(json).transpose()?)
        .bind(r.verification_passed)
        .bind(r.export_mode.map(|m| m.as_str()))
        .bind(r.export_size)
        .bind(r.export_duration_ms)
        .bind(r.import_duration_ms)
        .bind(r.indexing_duration_ms)
        .bind(&r.artifact_path)
        .bind(&r.artifact_checksum)
        .bind(&r.backup_file_path)
        .bind(json(&r.warnings)?)
        .bind(&r.error_message)
        .bind(&r.error_details)
        .bind(r.completed_at)
        .bind(r.duration_ms)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Lock, mutate with `f`, and write back if `f` reports a change.
    async fn modify_record(
        &self,
        sync_id: &str,
        f: impl FnOnce(&mut SyncRecord) -> bool + Send,
    ) -> Result<Option<SyncRecord>> {
        let mut tx = self.pool.begin().await?;
        let Some(mut record) = Self::lock_record(&mut tx, sync_id).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        if f(&mut record) {
            Self::store_record(&mut tx, &record).await?;
        }
        tx.commit().await?;
        Ok(Some(record))
    }
}

#[async_trait]
impl HistoryStore for Database {
    /// A second `running` row trips the partial unique index; that surfaces
    /// as `SyncInProgress` so admission fails the same way across processes.
    async fn create(&self, r: &SyncRecord) -> Result<()> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO sync_history ({}) VALUES
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
              $18, $19, $20, $21, $22, $23, $24, $25, $26, $27)",
            COLUMNS
        ))
        .bind(&r.sync_id)
        .bind(r.direction.as_str())
        .bind(r.status.as_str())
        .bind(r.current_phase.as_str())
        .bind(r.percent_complete)
        .bind(&r.current_table)
        .bind(r.synced_rows)
        .bind(r.total_rows)
        .bind(json(&r.tables_synced)?)
        .bind(r.verification_results.as_ref().map(json).transpose()?)
        .bind(r.verification_passed)
        .bind(r.export_mode.map(|m| m.as_str()))
        .bind(r.export_size)
        .bind(r.export_duration_ms)
        .bind(r.import_duration_ms)
        .bind(r.indexing_duration_ms)
        .bind(&r.artifact_path)
        .bind(&r.artifact_checksum)
        .bind(&r.backup_file_path)
        .bind(json(&r.warnings)?)
        .bind(&r.error_message)
        .bind(&r.error_details)
        .bind(r.dry_run)
        .bind(&r.triggered_by)
        .bind(r.started_at)
        .bind(r.completed_at)
        .bind(r.duration_ms)
        .execute(&self.pool)
        .await;
        match inserted {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e))
                if e.is_unique_violation() && e.constraint() == Some(ONE_RUNNING_INDEX) =>
            {
                let active_sync_id: String = sqlx::query_scalar(
                    "SELECT sync_id FROM sync_history WHERE status = 'running' LIMIT 1",
                )
                .fetch_optional(&self.pool)
                .await?
                .unwrap_or_default();
                Err(SyncError::SyncInProgress { active_sync_id }.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_progress(
        &self,
        sync_id: &str,
        progress: &SyncProgress,
    ) -> Result<Option<SyncRecord>> {
        self.modify_record(sync_id, |r| r.apply(progress)).await
    }

    async fn complete(
        &self,
        sync_id: &str,
        completion: &Completion,
    ) -> Result<Option<SyncRecord>> {
        self.modify_record(sync_id, |r| r.finish(completion)).await
    }

    async fn get(&self, sync_id: &str) -> Result<Option<SyncRecord>> {
        let row: Option<SyncHistoryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sync_history WHERE sync_id = $1",
            COLUMNS
        ))
        .bind(sync_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SyncRecord::try_from).transpose()
    }

    /// Dynamic WHERE built from the set filter fields; sort column and
    /// direction come from the filter's whitelists.
    async fn list(&self, filter: &HistoryFilter) -> Result<HistoryPage> {
        let mut conditions = Vec::new();
        let mut param_idx = 1u32;
        if filter.direction.is_some() {
            conditions.push(format!("direction = ${}", param_idx));
            param_idx += 1;
        }
        if filter.status.is_some() {
            conditions.push(format!("status = ${}", param_idx));
            param_idx += 1;
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*)::BIGINT FROM sync_history{}", where_clause);
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        if let Some(d) = filter.direction {
            count_query = count_query.bind(d.as_str());
        }
        if let Some(s) = filter.status {
            count_query = count_query.bind(s.as_str());
        }
        let total = count_query.fetch_one(&self.pool).await?;

        let sql = format!(
            "SELECT {} FROM sync_history{} ORDER BY {} {} NULLS LAST, sync_id {} LIMIT ${} OFFSET ${}",
            COLUMNS,
            where_clause,
            filter.safe_sort_column(),
            filter.safe_sort_dir(),
            filter.safe_sort_dir(),
            param_idx,
            param_idx + 1
        );
        let mut query = sqlx::query_as::<_, SyncHistoryRow>(&sql);
        if let Some(d) = filter.direction {
            query = query.bind(d.as_str());
        }
        if let Some(s) = filter.status {
            query = query.bind(s.as_str());
        }
        let rows = query
            .bind(filter.per_page() as i64)
            .bind(filter.offset() as i64)
            .fetch_all(&self.pool)
            .await?;
        let records = rows
            .into_iter()
            .map(SyncRecord::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(HistoryPage {
            records,
            total,
            page: filter.page(),
            per_page: filter.per_page(),
        })
    }

    async fn stats(&self, window_days: i64) -> Result<HistoryStats> {
        let (total, running, completed, failed, cancelled, mismatches, avg): (
            i64,
            i64,
            i64,
            i64,
            i64,
            i64,
            Option<f64>,
        ) = sqlx::query_as(
            "SELECT
                COUNT(*)::BIGINT,
                COUNT(*) FILTER (WHERE status = 'running')::BIGINT,
                COUNT(*) FILTER (WHERE status = 'completed')::BIGINT,
                COUNT(*) FILTER (WHERE status = 'failed')::BIGINT,
                COUNT(*) FILTER (WHERE status = 'cancelled')::BIGINT,
                COUNT(*) FILTER (WHERE status = 'completed' AND verification_passed = FALSE)::BIGINT,
                (AVG(duration_ms) FILTER (WHERE status = 'completed'))::FLOAT8
             FROM sync_history
             WHERE started_at >= NOW() - make_interval(days => $1::INT)",
        )
        .bind(window_days)
        .fetch_one(&self.pool)
        .await?;

        let by_direction: Vec<(String, i64, i64, i64, Option<chrono::DateTime<chrono::Utc>>)> =
            sqlx::query_as(
                "SELECT direction,
                    COUNT(*)::BIGINT,
                    COUNT(*) FILTER (WHERE status = 'completed')::BIGINT,
                    COUNT(*) FILTER (WHERE status = 'failed')::BIGINT,
                    MAX(completed_at) FILTER (WHERE status = 'completed' AND NOT dry_run)
                 FROM sync_history
                 WHERE started_at >= NOW() - make_interval(days => $1::INT)
                 GROUP BY direction
                 ORDER BY direction",
            )
            .bind(window_days)
            .fetch_all(&self.pool)
            .await?;

        Ok(HistoryStats {
            window_days,
            total,
            running,
            completed,
            failed,
            cancelled,
            verification_mismatches: mismatches,
            avg_completed_duration_ms: avg,
            by_direction: by_direction
                .into_iter()
                .map(|(direction, total, completed, failed, last)| DirectionStats {
                    direction,
                    total,
                    completed,
                    failed,
                    last_success_at: last,
                })
                .collect(),
        })
    }

    async fn running(&self) -> Result<Vec<SyncRecord>> {
        let rows: Vec<SyncHistoryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sync_history WHERE status = 'running' ORDER BY started_at",
            COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SyncRecord::try_from).collect()
    }

    async fn health_check(&self) -> Result<()> {
        Database::health_check(self).await
    }
}
