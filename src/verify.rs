//! # Verify — Row-count Comparison
//!
//! Counts every registry table on both sides and compares them exactly. The
//! result list keeps one entry per table in registry order so a divergence
//! is visible per table. Verification only reads.
//!
//! A table missing on either side counts as a mismatch, with `-1` recorded
//! for the side that lacks it.

use crate::endpoint::SyncEndpoint;
use crate::error::SyncResult;
use crate::record::VerificationResult;

async fn count_or_missing(endpoint: &dyn SyncEndpoint, table: &str, present: bool) -> SyncResult<i64> {
    if !present {
        return Ok(-1);
    }
    Ok(endpoint.row_count(table).await?)
}

pub async fn verify(
    source: &dyn SyncEndpoint,
    target: &dyn SyncEndpoint,
    tables: &[String],
) -> SyncResult<Vec<VerificationResult>> {
    let (on_source, on_target) =
        tokio::try_join!(source.existing_tables(tables), target.existing_tables(tables))?;

    let mut results = Vec::with_capacity(tables.len());
    for table in tables {
        let (source_count, target_count) = tokio::try_join!(
            count_or_missing(source, table, on_source.contains(table)),
            count_or_missing(target, table, on_target.contains(table)),
        )?;
        results.push(VerificationResult {
            table_name: table.clone(),
            source_count,
            target_count,
            matched: source_count >= 0 && source_count == target_count,
        });
    }
    Ok(results)
}

/// Names of tables whose counts diverged.
pub fn mismatched(results: &[VerificationResult]) -> Vec<String> {
    results
        .iter()
        .filter(|r| !r.matched)
        .map(|r| r.table_name.clone())
        .collect()
}
