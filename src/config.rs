//! TOML configuration for the sync orchestrator.
//!
//! Every field has a default, so an empty file (or no file) is valid.
//! Connection URLs usually come from the environment; when present on the
//! command line or in env vars they override the file.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tables::DEFAULT_HEAVY_INDEX_TABLES;

// ── Configuration Structs ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Local development database.
    pub local_url: Option<String>,
    /// Remote managed database.
    pub remote_url: Option<String>,
    /// Schema holding the registry tables on both sides.
    pub schema: String,
    /// Where export artifacts are written.
    pub artifact_dir: PathBuf,
    /// Where pre-import backups of the target are written.
    pub backup_dir: PathBuf,
    pub pg_dump_path: PathBuf,
    pub psql_path: PathBuf,
    /// Required target headroom as a multiple of the estimated source size.
    pub disk_headroom_factor: f64,
    /// Storage quota of the remote plan. Managed databases do not expose free
    /// disk, so headroom is computed as quota minus current database size.
    pub remote_disk_quota_bytes: Option<u64>,
    /// Table recording applied migrations; compared across source and target.
    pub migrations_table: String,
    /// Minimum migration version a non-empty target must have reached.
    pub min_migration_version: Option<String>,
    /// Warn when the target has no backup newer than `max_backup_age_hours`.
    pub backup_before_sync: bool,
    pub max_backup_age_hours: u64,
    /// Tables whose indexes are rebuilt after a remote-to-local import.
    pub heavy_index_tables: Vec<String>,
    /// Polling interval for status clients after the stream is lost.
    pub poll_interval_secs: u64,
    /// Delays between stream reconnect attempts before settling into polling.
    pub reconnect_delays_secs: Vec<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            local_url: None,
            remote_url: None,
            schema: "public".to_string(),
            artifact_dir: PathBuf::from("dbsync-artifacts"),
            backup_dir: PathBuf::from("dbsync-backups"),
            pg_dump_path: PathBuf::from("pg_dump"),
            psql_path: PathBuf::from("psql"),
            disk_headroom_factor: 2.0,
            remote_disk_quota_bytes: None,
            migrations_table: "schema_migrations".to_string(),
            min_migration_version: None,
            backup_before_sync: true,
            max_backup_age_hours: 24,
            heavy_index_tables: DEFAULT_HEAVY_INDEX_TABLES
                .iter()
                .map(|t| t.to_string())
                .collect(),
            poll_interval_secs: 2,
            reconnect_delays_secs: vec![1, 2, 4, 8, 16],
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn reconnect_delays(&self) -> Vec<Duration> {
        self.reconnect_delays_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }

    /// Apply command-line / environment overrides for the connection URLs.
    pub fn with_urls(mut self, local_url: Option<&str>, remote_url: Option<&str>) -> Self {
        if let Some(url) = local_url {
            self.local_url = Some(url.to_string());
        }
        if let Some(url) = remote_url {
            self.remote_url = Some(url.to_string());
        }
        self
    }

    pub fn local_url(&self) -> Result<&str> {
        self.local_url.as_deref().ok_or_else(|| {
            anyhow::anyhow!("local database URL is required (set --local-url or LOCAL_DATABASE_URL)")
        })
    }

    pub fn remote_url(&self) -> Result<&str> {
        self.remote_url.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "remote database URL is required (set --remote-url or REMOTE_DATABASE_URL)"
            )
        })
    }
}

// ── Parsing ─────────────────────────────────────────────────────

/// Parse a configuration from a TOML string.
pub fn parse_toml(content: &str) -> Result<SyncConfig> {
    let config: SyncConfig = toml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Parse a configuration file, or return defaults when no path is given.
pub fn load(path: Option<&Path>) -> Result<SyncConfig> {
    match path {
        Some(p) => {
            let content = std::fs::read_to_string(p)
                .map_err(|e| anyhow::anyhow!("cannot read config {}: {}", p.display(), e))?;
            parse_toml(&content)
        }
        None => Ok(SyncConfig::default()),
    }
}

fn validate_config(config: &SyncConfig) -> Result<()> {
    if config.schema.trim().is_empty() {
        anyhow::bail!("schema must not be empty");
    }
    if config.disk_headroom_factor < 1.0 {
        anyhow::bail!(
            "disk_headroom_factor must be at least 1.0 (got {})",
            config.disk_headroom_factor
        );
    }
    if config.poll_interval_secs == 0 {
        anyhow::bail!("poll_interval_secs must be positive");
    }
    for table in &config.heavy_index_tables {
        if !crate::tables::SYNC_TABLES.contains(&table.as_str()) {
            anyhow::bail!("heavy_index_tables entry '{}' is not a synced table", table);
        }
    }
    Ok(())
}
