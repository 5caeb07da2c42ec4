//! Error taxonomy for sync admission and execution.
//!
//! `SyncError` is what the controller records on a failed `SyncRecord` and
//! what the CLI turns into a process exit code. Persistence and glue code use
//! `anyhow`; those errors enter this taxonomy as `Internal`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::SyncPhase;

pub type SyncResult<T> = Result<T, SyncError>;

/// Machine-readable discriminant, stored as `error_details.kind`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SyncInProgress,
    ConnectionError,
    InsufficientDiskSpace,
    SchemaVersionMismatch,
    ExportFailure,
    ImportFailure,
    VerificationMismatch,
    CancelledByUser,
    Interrupted,
    RollbackFailure,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SyncInProgress => "sync_in_progress",
            ErrorKind::ConnectionError => "connection_error",
            ErrorKind::InsufficientDiskSpace => "insufficient_disk_space",
            ErrorKind::SchemaVersionMismatch => "schema_version_mismatch",
            ErrorKind::ExportFailure => "export_failure",
            ErrorKind::ImportFailure => "import_failure",
            ErrorKind::VerificationMismatch => "verification_mismatch",
            ErrorKind::CancelledByUser => "cancelled_by_user",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::RollbackFailure => "rollback_failure",
            ErrorKind::InternalError => "internal_error",
        }
    }

    /// Process exit code for the CLI entry point.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::ConnectionError | ErrorKind::SchemaVersionMismatch => 2,
            ErrorKind::ExportFailure | ErrorKind::ImportFailure | ErrorKind::RollbackFailure => 3,
            ErrorKind::VerificationMismatch => 4,
            ErrorKind::CancelledByUser => 5,
            ErrorKind::SyncInProgress
            | ErrorKind::InsufficientDiskSpace
            | ErrorKind::Interrupted
            | ErrorKind::InternalError => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    /// Another sync holds the process-wide token.
    #[error("sync {active_sync_id} is already running")]
    SyncInProgress { active_sync_id: String },

    #[error("cannot connect to {endpoint} database: {message}")]
    Connection { endpoint: String, message: String },

    /// Warning-level: target headroom below the configured multiple of source size.
    #[error("target has {available} bytes free, {required} recommended")]
    InsufficientDiskSpace { required: u64, available: u64 },

    #[error("schema version mismatch (source {source_version:?}, target {target_version:?}): {message}")]
    SchemaVersionMismatch {
        source_version: Option<String>,
        target_version: Option<String>,
        message: String,
        fatal: bool,
    },

    #[error("export failed: {message}")]
    ExportFailure {
        message: String,
        exit_code: Option<i32>,
        output_tail: Option<String>,
    },

    #[error("import failed: {message}")]
    ImportFailure {
        message: String,
        exit_code: Option<i32>,
        output_tail: Option<String>,
    },

    #[error("row counts differ for {}", tables.join(", "))]
    VerificationMismatch { tables: Vec<String> },

    #[error("sync cancelled by user")]
    CancelledByUser,

    #[error("sync interrupted: no owning process after restart")]
    Interrupted,

    /// The target could not be restored from its pre-import backup and is in
    /// an unknown state.
    #[error("rollback failed, target state unknown: {message} (after: {cause})")]
    RollbackFailure { message: String, cause: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::SyncInProgress { .. } => ErrorKind::SyncInProgress,
            SyncError::Connection { .. } => ErrorKind::ConnectionError,
            SyncError::InsufficientDiskSpace { .. } => ErrorKind::InsufficientDiskSpace,
            SyncError::SchemaVersionMismatch { .. } => ErrorKind::SchemaVersionMismatch,
            SyncError::ExportFailure { .. } => ErrorKind::ExportFailure,
            SyncError::ImportFailure { .. } => ErrorKind::ImportFailure,
            SyncError::VerificationMismatch { .. } => ErrorKind::VerificationMismatch,
            SyncError::CancelledByUser => ErrorKind::CancelledByUser,
            SyncError::Interrupted => ErrorKind::Interrupted,
            SyncError::RollbackFailure { .. } => ErrorKind::RollbackFailure,
            SyncError::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Whether this error blocks progression. Disk headroom and minor schema
    /// skew are survivable warnings.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::InsufficientDiskSpace { .. } => false,
            SyncError::SchemaVersionMismatch { fatal, .. } => *fatal,
            _ => true,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    /// Structured detail persisted alongside `error_message`.
    pub fn details(&self, phase: Option<SyncPhase>) -> serde_json::Value {
        let mut details = serde_json::json!({
            "kind": self.kind(),
            "phase": phase,
        });
        match self {
            SyncError::ExportFailure {
                exit_code,
                output_tail,
                ..
            }
            | SyncError::ImportFailure {
                exit_code,
                output_tail,
                ..
            } => {
                details["exit_code"] = serde_json::json!(exit_code);
                details["output_tail"] = serde_json::json!(output_tail);
            }
            SyncError::Connection { endpoint, .. } => {
                details["endpoint"] = serde_json::json!(endpoint);
            }
            SyncError::SchemaVersionMismatch {
                source_version,
                target_version,
                ..
            } => {
                details["source_version"] = serde_json::json!(source_version);
                details["target_version"] = serde_json::json!(target_version);
            }
            SyncError::VerificationMismatch { tables } => {
                details["tables"] = serde_json::json!(tables);
            }
            SyncError::RollbackFailure { cause, .. } => {
                details["cause"] = serde_json::json!(cause);
            }
            _ => {}
        }
        details
    }
}

/// Typed errors that travelled through an `anyhow` boundary keep their kind.
impl From<anyhow::Error> for SyncError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<SyncError>() {
            Ok(typed) => typed,
            Err(e) => SyncError::Internal(format!("{:#}", e)),
        }
    }
}

/// Keep the last `max_lines` lines of subprocess output for error details.
pub fn output_tail(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
