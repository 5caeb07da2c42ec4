//! # Validate — Pre-flight Checks
//!
//! Each check passes, warns, or fails independently:
//!
//! | Check | Outcome on problem |
//! |-------|--------------------|
//! | Connectivity to source and target | fatal `Connection` |
//! | Target free disk >= factor x source size | warning `InsufficientDiskSpace` |
//! | Migration version skew | warning `SchemaVersionMismatch` |
//! | Partially initialized target below baseline | fatal `SchemaVersionMismatch` |
//! | Recent backup of the target (policy) | warning |
//!
//! Connectivity failures short-circuit the remaining checks.

use serde::Serialize;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::endpoint::{Endpoints, SyncEndpoint};
use crate::error::SyncError;
use crate::record::{Direction, Side};
use crate::tables::sync_tables;

const PING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    DiskSpace,
    SchemaVersion,
    Backup,
}

#[derive(Clone, Debug, Serialize)]
pub struct ValidationWarning {
    pub check: Check,
    pub message: String,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub warnings: Vec<ValidationWarning>,
    pub fatal: Vec<SyncError>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.fatal.is_empty()
    }

    fn warn(&mut self, check: Check, message: String) {
        warn!(check = ?check, "{}", message);
        self.warnings.push(ValidationWarning { check, message });
    }

    /// Fold every fatal finding into the one error the sync fails with.
    /// Several unreachable endpoints become a single `Connection` naming all
    /// of them.
    pub fn into_fatal(self) -> Option<SyncError> {
        let mut fatal = self.fatal;
        let all_connection = fatal
            .iter()
            .all(|e| matches!(e, SyncError::Connection { .. }));
        if fatal.len() < 2 || !all_connection {
            return (!fatal.is_empty()).then(|| fatal.remove(0));
        }
        let mut endpoints = Vec::new();
        let mut messages = Vec::new();
        for err in fatal {
            if let SyncError::Connection { endpoint, message } = err {
                messages.push(format!("{}: {}", endpoint, message));
                endpoints.push(endpoint);
            }
        }
        Some(SyncError::Connection {
            endpoint: endpoints.join(" and "),
            message: messages.join("; "),
        })
    }

    /// Route a taxonomy error to warnings or fatal by its severity.
    fn push(&mut self, check: Check, err: SyncError) {
        if err.is_fatal() {
            self.fatal.push(err);
        } else {
            self.warn(check, err.to_string());
        }
    }
}

/// Order migration versions numerically when both are integers
/// (timestamp-style), lexically otherwise.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (a.parse::<u128>(), b.parse::<u128>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

pub struct Validator {
    endpoints: Endpoints,
    config: Arc<SyncConfig>,
}

impl Validator {
    pub fn new(endpoints: Endpoints, config: Arc<SyncConfig>) -> Self {
        Validator { endpoints, config }
    }

    pub async fn validate(&self, direction: Direction) -> ValidationReport {
        let mut report = ValidationReport::default();
        let source = self.endpoints.source(direction);
        let target = self.endpoints.target(direction);

        for endpoint in [source, target] {
            if let Err(e) = ping(endpoint.as_ref()).await {
                report.fatal.push(e);
            }
        }
        if !report.is_ok() {
            return report;
        }

        self.check_disk(source.as_ref(), target.as_ref(), &mut report)
            .await;
        self.check_schema(source.as_ref(), target.as_ref(), &mut report)
            .await;
        if self.config.backup_before_sync {
            check_backup_age(
                &self.config.backup_dir,
                direction.target(),
                Duration::from_secs(self.config.max_backup_age_hours * 3600),
                &mut report,
            );
        }
        report
    }

    async fn check_disk(
        &self,
        source: &dyn SyncEndpoint,
        target: &dyn SyncEndpoint,
        report: &mut ValidationReport,
    ) {
        let source_size = match source.tables_size(&sync_tables()).await {
            Ok(size) => size,
            Err(e) => {
                report.warn(
                    Check::DiskSpace,
                    format!("could not estimate source size: {:#}", e),
                );
                return;
            }
        };
        let required = (source_size as f64 * self.config.disk_headroom_factor).ceil() as u64;
        match target.free_disk_bytes().await {
            Ok(Some(available)) if available < required => {
                report.push(
                    Check::DiskSpace,
                    SyncError::InsufficientDiskSpace {
                        required,
                        available,
                    },
                );
            }
            Ok(Some(available)) => {
                debug!(required, available, "disk headroom ok");
            }
            Ok(None) => report.warn(
                Check::DiskSpace,
                format!(
                    "free disk space on {} target is unknown; {} bytes recommended",
                    target.side(),
                    required
                ),
            ),
            Err(e) => report.warn(
                Check::DiskSpace,
                format!("could not determine target free disk space: {:#}", e),
            ),
        }
    }

    async fn check_schema(
        &self,
        source: &dyn SyncEndpoint,
        target: &dyn SyncEndpoint,
        report: &mut ValidationReport,
    ) {
        let registry = sync_tables();
        let versions = tokio::try_join!(source.migration_version(), target.migration_version());
        let (source_version, target_version) = match versions {
            Ok(v) => v,
            Err(e) => {
                report.warn(
                    Check::SchemaVersion,
                    format!("could not read migration versions: {:#}", e),
                );
                return;
            }
        };
        let present = match target.existing_tables(&registry).await {
            Ok(tables) => tables.len(),
            Err(e) => {
                report.warn(
                    Check::SchemaVersion,
                    format!("could not inspect target tables: {:#}", e),
                );
                return;
            }
        };

        let partially_initialized = present > 0 && present < registry.len();
        let below_baseline = match (&target_version, &self.config.min_migration_version) {
            (None, _) => true,
            (Some(v), Some(min)) => compare_versions(v, min) == Ordering::Less,
            (Some(_), None) => false,
        };
        if partially_initialized && below_baseline {
            report.push(
                Check::SchemaVersion,
                SyncError::SchemaVersionMismatch {
                    source_version,
                    target_version,
                    message: format!(
                        "target has {} of {} tables and lacks the migration baseline",
                        present,
                        registry.len()
                    ),
                    fatal: true,
                },
            );
            return;
        }

        if let (Some(s), Some(t)) = (&source_version, &target_version) {
            if compare_versions(s, t) != Ordering::Equal {
                let message = if compare_versions(s, t) == Ordering::Greater {
                    "target is behind source"
                } else {
                    "target is ahead of source"
                };
                report.push(
                    Check::SchemaVersion,
                    SyncError::SchemaVersionMismatch {
                        source_version,
                        target_version,
                        message: message.to_string(),
                        fatal: false,
                    },
                );
            }
        }
    }
}

async fn ping(endpoint: &dyn SyncEndpoint) -> Result<(), SyncError> {
    let side = endpoint.side();
    match tokio::time::timeout(PING_TIMEOUT, endpoint.ping()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(SyncError::Connection {
            endpoint: side.to_string(),
            message: format!("{:#}", e),
        }),
        Err(_) => Err(SyncError::Connection {
            endpoint: side.to_string(),
            message: format!("no response within {}s", PING_TIMEOUT.as_secs()),
        }),
    }
}

/// Backup artifacts of a side are named `<side>-<sync_id>.sql`.
pub fn backup_file_name(side: Side, sync_id: &str) -> String {
    format!("{}-{}.sql", side, sync_id)
}

/// Modification time of the newest backup of `side` in `dir`.
pub fn newest_backup(dir: &Path, side: Side) -> Option<SystemTime> {
    let prefix = format!("{}-", side);
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with(&prefix) && name.ends_with(".sql")
        })
        .filter_map(|entry| entry.metadata().ok()?.modified().ok())
        .max()
}

fn check_backup_age(dir: &Path, side: Side, max_age: Duration, report: &mut ValidationReport) {
    match newest_backup(dir, side) {
        None => report.warn(
            Check::Backup,
            format!("no previous backup of the {} database in {}", side, dir.display()),
        ),
        Some(modified) => {
            let age = SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default();
            if age > max_age {
                report.warn(
                    Check::Backup,
                    format!(
                        "last backup of the {} database is {}h old (limit {}h)",
                        side,
                        age.as_secs() / 3600,
                        max_age.as_secs() / 3600
                    ),
                );
            }
        }
    }
}
