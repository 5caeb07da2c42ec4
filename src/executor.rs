//! # Executor — Export, Import, Backup and Rollback
//!
//! Bulk data movement goes through a [`DumpTool`]: `dump` writes an artifact
//! from one database, `restore` applies an artifact to another. The
//! production tool shells out to `pg_dump` and `psql`; tests substitute an
//! in-memory fake.
//!
//! ## Export mode
//!
//! The target decides the artifact kind. A target holding the full table set
//! gets a data-only artifact (repeat syncs never hit "relation already
//! exists"); anything else gets schema + data.
//!
//! ## Success detection
//!
//! `restore` succeeds iff the tool's exit status is zero. The tool's output
//! stream is parsed only for progress ("COPY n" tags), never for success.
//!
//! ## Rollback
//!
//! Before preparation the target's existing registry tables are dumped to
//! `backup_dir`. Rollback truncates the target and reapplies that backup; a
//! target that was uninitialized has no backup and is only truncated.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::db::strip_password;
use crate::endpoint::SyncEndpoint;
use crate::error::{output_tail, SyncError, SyncResult};
use crate::record::ExportMode;
use crate::tables::qualified;
use crate::validate::backup_file_name;

const OUTPUT_TAIL_LINES: usize = 20;

/// A table finished loading during restore.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableLoaded {
    pub table_name: String,
    pub row_count: i64,
}

#[async_trait]
pub trait DumpTool: Send + Sync {
    /// Write an artifact of `tables` (schema-qualified) from `source` to `out`.
    async fn dump(
        &self,
        source: &dyn SyncEndpoint,
        tables: &[String],
        mode: ExportMode,
        out: &Path,
    ) -> SyncResult<()>;

    /// Apply `artifact` to `target` in one transaction, reporting each loaded
    /// table on `progress`. Returns the tool's raw output.
    async fn restore(
        &self,
        target: &dyn SyncEndpoint,
        artifact: &Path,
        progress: mpsc::UnboundedSender<TableLoaded>,
    ) -> SyncResult<String>;
}

// ── pg_dump / psql ──────────────────────────────────────────────

pub struct PgDumpTool {
    pg_dump: PathBuf,
    psql: PathBuf,
}

impl PgDumpTool {
    pub fn new(pg_dump: PathBuf, psql: PathBuf) -> Self {
        PgDumpTool { pg_dump, psql }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.pg_dump_path.clone(), config.psql_path.clone())
    }
}

/// A `Command` for a libpq tool. The password rides in `PGPASSWORD`, never
/// on the command line where `ps` can read it.
fn pg_command(program: &Path, url: &str) -> Command {
    let mut cmd = Command::new(program);
    if let (_, Some(password)) = strip_password(url) {
        cmd.env("PGPASSWORD", password);
    }
    cmd
}

pub fn dump_args(url: &str, tables: &[String], mode: ExportMode, out: &Path) -> Vec<String> {
    let (dbname, _) = strip_password(url);
    let mut args = vec![
        format!("--dbname={}", dbname),
        "--format=plain".to_string(),
        "--no-owner".to_string(),
        "--no-privileges".to_string(),
        format!("--file={}", out.display()),
    ];
    if mode == ExportMode::DataOnly {
        args.push("--data-only".to_string());
    }
    args.extend(tables.iter().map(|t| format!("--table={}", t)));
    args
}

pub fn restore_args(url: &str, artifact: &Path) -> Vec<String> {
    let (dbname, _) = strip_password(url);
    vec![
        format!("--dbname={}", dbname),
        "--no-psqlrc".to_string(),
        "--set=ON_ERROR_STOP=1".to_string(),
        "--single-transaction".to_string(),
        format!("--file={}", artifact.display()),
    ]
}

/// Row count from a psql `COPY n` command tag.
pub fn parse_copy_tag(line: &str) -> Option<i64> {
    line.trim().strip_prefix("COPY ")?.trim().parse().ok()
}

/// Follows `COPY ... FROM stdin;` blocks line by line over raw artifact
/// bytes. Data lines are skipped undecoded, so any client encoding works.
#[derive(Default)]
struct CopyScanner {
    in_data: bool,
}

impl CopyScanner {
    /// The table a header line starts loading, without schema prefix or quotes.
    fn feed(&mut self, line: &[u8]) -> Option<String> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if self.in_data {
            if line == b"\\." {
                self.in_data = false;
            }
            return None;
        }
        let rest = line.strip_prefix(b"COPY ")?;
        let end = line
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map_or(0, |i| i + 1);
        if !line[..end].ends_with(b"FROM stdin;") {
            return None;
        }
        self.in_data = true;
        let name_len = rest
            .iter()
            .position(|&b| b == b' ' || b == b'(')
            .unwrap_or(rest.len());
        let name = String::from_utf8_lossy(&rest[..name_len]);
        let bare = name.rsplit('.').next().unwrap_or(&name);
        Some(bare.trim_matches('"').to_string())
    }
}

/// Tables loaded by an artifact's `COPY ... FROM stdin;` blocks, in order,
/// without schema prefix or quotes.
pub fn copy_targets(artifact: &[u8]) -> Vec<String> {
    let mut scanner = CopyScanner::default();
    artifact
        .split(|&b| b == b'\n')
        .filter_map(|line| scanner.feed(line))
        .collect()
}

/// [`copy_targets`] streamed from disk, one line in memory at a time.
pub async fn read_copy_targets(path: &Path) -> std::io::Result<Vec<String>> {
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).split(b'\n');
    let mut scanner = CopyScanner::default();
    let mut tables = Vec::new();
    while let Some(line) = lines.next_segment().await? {
        tables.extend(scanner.feed(&line));
    }
    Ok(tables)
}

fn spawn_failure(tool: &Path, e: std::io::Error, export: bool) -> SyncError {
    let message = format!("failed to start {}: {}", tool.display(), e);
    if export {
        SyncError::ExportFailure {
            message,
            exit_code: None,
            output_tail: None,
        }
    } else {
        SyncError::ImportFailure {
            message,
            exit_code: None,
            output_tail: None,
        }
    }
}

#[async_trait]
impl DumpTool for PgDumpTool {
    async fn dump(
        &self,
        source: &dyn SyncEndpoint,
        tables: &[String],
        mode: ExportMode,
        out: &Path,
    ) -> SyncResult<()> {
        let output = pg_command(&self.pg_dump, source.connection_url())
            .args(dump_args(source.connection_url(), tables, mode, out))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_failure(&self.pg_dump, e, true))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::ExportFailure {
                message: format!("pg_dump exited with {}", output.status),
                exit_code: output.status.code(),
                output_tail: Some(output_tail(&stderr, OUTPUT_TAIL_LINES)),
            });
        }
        Ok(())
    }

    async fn restore(
        &self,
        target: &dyn SyncEndpoint,
        artifact: &Path,
        progress: mpsc::UnboundedSender<TableLoaded>,
    ) -> SyncResult<String> {
        let copy_order = read_copy_targets(artifact).await.map_err(|e| {
            SyncError::ImportFailure {
                message: format!("cannot read artifact {}: {}", artifact.display(), e),
                exit_code: None,
                output_tail: None,
            }
        })?;

        let mut child = pg_command(&self.psql, target.connection_url())
            .args(restore_args(target.connection_url(), artifact))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_failure(&self.psql, e, false))?;

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut buf).await;
            }
            String::from_utf8_lossy(&buf).into_owned()
        });

        let mut raw = String::new();
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).split(b'\n');
            let mut next = 0usize;
            while let Ok(Some(line)) = lines.next_segment().await {
                let line = String::from_utf8_lossy(&line);
                if let Some(rows) = parse_copy_tag(&line) {
                    if let Some(table) = copy_order.get(next) {
                        let _ = progress.send(TableLoaded {
                            table_name: table.clone(),
                            row_count: rows,
                        });
                    }
                    next += 1;
                }
                raw.push_str(&line);
                raw.push('\n');
            }
        }

        let status = child.wait().await.map_err(|e| SyncError::ImportFailure {
            message: format!("waiting for psql: {}", e),
            exit_code: None,
            output_tail: None,
        })?;
        let stderr = stderr_task.await.unwrap_or_default();
        raw.push_str(&stderr);

        if !status.success() {
            return Err(SyncError::ImportFailure {
                message: format!("psql exited with {}", status),
                exit_code: status.code(),
                output_tail: Some(output_tail(&raw, OUTPUT_TAIL_LINES)),
            });
        }
        Ok(raw)
    }
}

// ── Executor ────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct ExportOutcome {
    pub artifact_path: PathBuf,
    pub mode: ExportMode,
    pub size_bytes: u64,
    pub checksum: String,
    pub duration: Duration,
}

#[derive(Clone, Debug)]
pub struct ImportOutcome {
    pub duration: Duration,
    pub raw_output: String,
}

/// SHA-256 of a file, hex encoded, read in chunks.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Clone)]
pub struct Executor {
    tool: Arc<dyn DumpTool>,
    config: Arc<SyncConfig>,
}

impl Executor {
    pub fn new(tool: Arc<dyn DumpTool>, config: Arc<SyncConfig>) -> Self {
        Executor { tool, config }
    }

    fn qualify(&self, tables: &[String]) -> Vec<String> {
        tables
            .iter()
            .map(|t| qualified(&self.config.schema, t))
            .collect()
    }

    /// Full artifact for a target missing any registry table, data-only
    /// otherwise.
    pub async fn select_mode(
        &self,
        target: &dyn SyncEndpoint,
        tables: &[String],
    ) -> SyncResult<ExportMode> {
        let existing = target.existing_tables(tables).await?;
        Ok(if existing.len() == tables.len() {
            ExportMode::DataOnly
        } else {
            ExportMode::Full
        })
    }

    pub async fn export(
        &self,
        sync_id: &str,
        source: &dyn SyncEndpoint,
        target: &dyn SyncEndpoint,
        tables: &[String],
    ) -> SyncResult<ExportOutcome> {
        let mode = self.select_mode(target, tables).await?;
        let dir = &self.config.artifact_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SyncError::ExportFailure {
                message: format!("cannot create artifact dir {}: {}", dir.display(), e),
                exit_code: None,
                output_tail: None,
            })?;
        let artifact_path = dir.join(format!("{}-{}.sql", sync_id, source.side()));

        info!(sync_id, mode = mode.as_str(), path = %artifact_path.display(), "exporting");
        let started = Instant::now();
        self.tool
            .dump(source, &self.qualify(tables), mode, &artifact_path)
            .await?;
        let duration = started.elapsed();

        let artifact_error = |e: std::io::Error| SyncError::ExportFailure {
            message: format!("artifact {} unreadable: {}", artifact_path.display(), e),
            exit_code: None,
            output_tail: None,
        };
        let size_bytes = tokio::fs::metadata(&artifact_path)
            .await
            .map_err(artifact_error)?
            .len();
        let checksum = sha256_file(&artifact_path).await.map_err(artifact_error)?;
        debug!(sync_id, size_bytes, %checksum, "artifact written");

        Ok(ExportOutcome {
            artifact_path,
            mode,
            size_bytes,
            checksum,
            duration,
        })
    }

    pub async fn import(
        &self,
        target: &dyn SyncEndpoint,
        artifact: &Path,
        progress: mpsc::UnboundedSender<TableLoaded>,
    ) -> SyncResult<ImportOutcome> {
        let started = Instant::now();
        let raw_output = self.tool.restore(target, artifact, progress).await?;
        Ok(ImportOutcome {
            duration: started.elapsed(),
            raw_output,
        })
    }

    /// Dump the target's existing registry tables to `backup_dir`. Returns
    /// `None` when the target has none of them.
    pub async fn backup(
        &self,
        sync_id: &str,
        target: &dyn SyncEndpoint,
        tables: &[String],
    ) -> SyncResult<Option<PathBuf>> {
        let existing = target.existing_tables(tables).await?;
        if existing.is_empty() {
            info!(sync_id, side = %target.side(), "target uninitialized, no backup taken");
            return Ok(None);
        }
        let dir = &self.config.backup_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SyncError::ExportFailure {
                message: format!("cannot create backup dir {}: {}", dir.display(), e),
                exit_code: None,
                output_tail: None,
            })?;
        let path = dir.join(backup_file_name(target.side(), sync_id));
        self.tool
            .dump(target, &self.qualify(&existing), ExportMode::DataOnly, &path)
            .await
            .map_err(|e| match e {
                SyncError::ExportFailure {
                    message,
                    exit_code,
                    output_tail,
                } => SyncError::ExportFailure {
                    message: format!("backup of target failed: {}", message),
                    exit_code,
                    output_tail,
                },
                other => other,
            })?;
        info!(sync_id, path = %path.display(), tables = existing.len(), "target backed up");
        Ok(Some(path))
    }

    /// Return the target to its pre-sync contents.
    pub async fn rollback(
        &self,
        target: &dyn SyncEndpoint,
        tables: &[String],
        backup: Option<&Path>,
    ) -> SyncResult<()> {
        let existing = target.existing_tables(tables).await?;
        target.truncate(&existing).await?;
        match backup {
            Some(path) => {
                let (tx, _rx) = mpsc::unbounded_channel();
                self.tool.restore(target, path, tx).await?;
                info!(side = %target.side(), path = %path.display(), "target restored from backup");
            }
            None => warn!(side = %target.side(), "no backup to restore; target left truncated"),
        }
        Ok(())
    }
}
