pub mod broadcast;
pub mod config;
pub mod confirm;
pub mod controller;
pub mod dashboard;
pub mod db;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod guard;
pub mod history;
pub mod prepare;
pub mod prom_metrics;
pub mod record;
pub mod tables;
pub mod validate;
pub mod verify;
pub mod watch;

pub use controller::{SyncController, SyncRequest};
pub use error::{SyncError, SyncResult};
pub use record::{Direction, SyncRecord, SyncStatus};
