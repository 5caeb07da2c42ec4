//! # Prometheus Metrics — Sync Orchestrator Exposition
//!
//! Rendered in the Prometheus text format on `/metrics`.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `dbsync_syncs_started_total` | Counter | `direction` | Syncs admitted |
//! | `dbsync_syncs_finished_total` | Counter | `direction`, `status` | Syncs reaching a terminal status |
//! | `dbsync_syncs_rejected_total` | Counter | — | Admissions refused by the concurrency guard |
//! | `dbsync_sync_active` | Gauge | — | 1 while a sync runs |
//! | `dbsync_phase_duration_seconds` | Histogram | `phase` | Wall time per completed phase |
//! | `dbsync_rows_synced_total` | Counter | `direction` | Rows loaded into targets |
//! | `dbsync_http_request_duration_seconds` | Histogram | `method`, `path` | HTTP latency |

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::record::{Direction, SyncPhase, SyncStatus};

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct DirectionLabel {
    pub direction: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct FinishedLabel {
    pub direction: String,
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct PhaseLabel {
    pub phase: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct HttpLabel {
    pub method: String,
    pub path: String,
}

/// All fields are atomic and safe to update from any task.
pub struct Metrics {
    pub registry: Registry,
    pub syncs_started: Family<DirectionLabel, Counter>,
    pub syncs_finished: Family<FinishedLabel, Counter>,
    pub syncs_rejected: Counter,
    pub sync_active: Gauge,
    pub phase_duration: Family<PhaseLabel, Histogram>,
    pub rows_synced: Family<DirectionLabel, Counter>,
    pub http_request_duration: Family<HttpLabel, Histogram>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let syncs_started = Family::<DirectionLabel, Counter>::default();
        registry.register(
            "dbsync_syncs_started",
            "Syncs admitted by direction",
            syncs_started.clone(),
        );

        let syncs_finished = Family::<FinishedLabel, Counter>::default();
        registry.register(
            "dbsync_syncs_finished",
            "Syncs reaching a terminal status",
            syncs_finished.clone(),
        );

        let syncs_rejected = Counter::default();
        registry.register(
            "dbsync_syncs_rejected",
            "Sync requests rejected because another sync is running",
            syncs_rejected.clone(),
        );

        let sync_active = Gauge::default();
        registry.register(
            "dbsync_sync_active",
            "Whether a sync is currently running",
            sync_active.clone(),
        );

        // 0.1s .. ~55min
        let phase_duration = Family::<PhaseLabel, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.1, 3.0, 11))
        });
        registry.register(
            "dbsync_phase_duration_seconds",
            "Wall time of completed sync phases",
            phase_duration.clone(),
        );

        let rows_synced = Family::<DirectionLabel, Counter>::default();
        registry.register(
            "dbsync_rows_synced",
            "Rows loaded into sync targets",
            rows_synced.clone(),
        );

        let http_request_duration = Family::<HttpLabel, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.005, 2.0, 12))
        });
        registry.register(
            "dbsync_http_request_duration_seconds",
            "HTTP request latency",
            http_request_duration.clone(),
        );

        Self {
            registry,
            syncs_started,
            syncs_finished,
            syncs_rejected,
            sync_active,
            phase_duration,
            rows_synced,
            http_request_duration,
        }
    }

    pub fn record_started(&self, direction: Direction) {
        self.syncs_started
            .get_or_create(&DirectionLabel {
                direction: direction.as_str().to_string(),
            })
            .inc();
        self.sync_active.set(1);
    }

    pub fn record_finished(&self, direction: Direction, status: SyncStatus, rows: i64) {
        self.syncs_finished
            .get_or_create(&FinishedLabel {
                direction: direction.as_str().to_string(),
                status: status.as_str().to_string(),
            })
            .inc();
        if rows > 0 {
            self.rows_synced
                .get_or_create(&DirectionLabel {
                    direction: direction.as_str().to_string(),
                })
                .inc_by(rows as u64);
        }
        self.sync_active.set(0);
    }

    pub fn observe_phase(&self, phase: SyncPhase, secs: f64) {
        self.phase_duration
            .get_or_create(&PhaseLabel {
                phase: phase.as_str().to_string(),
            })
            .observe(secs);
    }

    pub fn encode(&self) -> String {
        let mut buf = String::new();
        encode(&mut buf, &self.registry).expect("encoding metrics into a String cannot fail");
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_updates_counters_and_gauge() {
        let m = Metrics::new();
        m.record_started(Direction::LocalToRemote);
        assert_eq!(m.sync_active.get(), 1);
        m.observe_phase(SyncPhase::Export, 1.5);
        m.record_finished(Direction::LocalToRemote, SyncStatus::Completed, 120);
        assert_eq!(m.sync_active.get(), 0);

        let output = m.encode();
        assert!(output.contains("dbsync_syncs_started_total{direction=\"local_to_remote\"} 1"));
        assert!(output.contains("status=\"completed\""));
        assert!(output.contains("dbsync_rows_synced_total{direction=\"local_to_remote\"} 120"));
        assert!(output.contains("dbsync_phase_duration_seconds"));
    }

    #[test]
    fn default_registry_lists_unlabelled_metrics() {
        let output = Metrics::new().encode();
        assert!(output.contains("dbsync_sync_active"));
        assert!(output.contains("dbsync_syncs_rejected_total"));
    }
}
