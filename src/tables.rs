//! # Tables — Syncable Table Registry
//!
//! The fixed set of application tables copied by every sync, and the tables
//! that are never copied (ephemeral session and request-log data). The list is
//! static: a sync is always a full replace of exactly these tables.
//!
//! Identifiers come in two renderings:
//!
//! - [`qualified`] — `schema.table`, the form handed to the dump/restore tool.
//!   Connection poolers in front of managed databases reject unqualified names.
//! - [`quoted`] — `"schema"."table"`, the form interpolated into SQL.

/// Tables included in every sync, in dependency order (parents first).
pub const SYNC_TABLES: [&str; 17] = [
    "users",
    "user_settings",
    "workspaces",
    "workspace_members",
    "projects",
    "documents",
    "document_versions",
    "document_chunks",
    "chunk_embeddings",
    "tags",
    "document_tags",
    "collections",
    "collection_documents",
    "comments",
    "attachments",
    "saved_searches",
    "integrations",
];

/// Tables never synced: per-environment sessions, request logs, and locks.
pub const EXCLUDED_TABLES: [&str; 4] = [
    "sessions",
    "request_logs",
    "rate_limit_buckets",
    "job_locks",
];

/// Tables carrying vector or other expensive indexes, rebuilt after a
/// remote-to-local import.
pub const DEFAULT_HEAVY_INDEX_TABLES: [&str; 2] = ["document_chunks", "chunk_embeddings"];

/// Owned copy of the registry, for APIs that take `&[String]`.
pub fn sync_tables() -> Vec<String> {
    SYNC_TABLES.iter().map(|t| t.to_string()).collect()
}

pub fn is_excluded(table: &str) -> bool {
    EXCLUDED_TABLES.contains(&table)
}

/// `schema.table`, as passed to the dump tool's `--table` option.
pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", schema, table)
}

/// Quote a single SQL identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// `"schema"."table"`, safe for interpolation into SQL text.
pub fn quoted(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}
