//! Preparation stage: clear the target's registry tables before import.
//!
//! One cascading `TRUNCATE` over every registry table present on the target,
//! in one transaction. A target with none of the tables is left alone.

use tracing::info;

use crate::endpoint::SyncEndpoint;
use crate::error::SyncResult;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Preparation {
    Truncated { tables: usize },
    /// Target never initialized; the full artifact will create the tables.
    Skipped,
}

pub async fn prepare(target: &dyn SyncEndpoint, tables: &[String]) -> SyncResult<Preparation> {
    let existing = target.existing_tables(tables).await?;
    if existing.is_empty() {
        info!(side = %target.side(), "target uninitialized, skipping truncate");
        return Ok(Preparation::Skipped);
    }
    target.truncate(&existing).await?;
    info!(side = %target.side(), tables = existing.len(), "target truncated");
    Ok(Preparation::Truncated {
        tables: existing.len(),
    })
}
