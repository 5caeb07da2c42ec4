//! # Dashboard — HTTP Control Surface
//!
//! Axum server exposing sync admission, status, cancellation, history and
//! live streams.
//!
//! | Route | Handler |
//! |-------|---------|
//! | `POST /api/sync` | admit a sync (202, or 409 with the running id) |
//! | `GET /api/sync/history` | paged history, `format=csv` for export |
//! | `GET /api/sync/stats` | aggregate outcomes over a window |
//! | `GET /api/sync/{sync_id}` | record snapshot (polling channel) |
//! | `POST /api/sync/{sync_id}/cancel` | request cancellation |
//! | `GET /api/sync/{sync_id}/stream` | WebSocket stream for one sync |
//! | `GET /ws` | WebSocket stream of every update |
//! | `GET /healthz`, `/readyz`, `/metrics` | probes and Prometheus |

mod routes_health;
mod routes_history;
mod routes_sync;
mod websocket;

use anyhow::Result;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Instrument};

use crate::broadcast::StatusBroadcaster;
use crate::controller::SyncController;
use crate::history::HistoryStore;
use crate::prom_metrics;
use crate::record::SyncRecord;

pub struct AppState {
    pub controller: SyncController,
    pub store: Arc<dyn HistoryStore>,
    pub broadcaster: Arc<StatusBroadcaster>,
    pub prom_metrics: Arc<prom_metrics::Metrics>,
}

impl AppState {
    pub fn new(controller: SyncController, prom_metrics: Arc<prom_metrics::Metrics>) -> Arc<Self> {
        Arc::new(AppState {
            store: Arc::clone(controller.store()),
            broadcaster: Arc::clone(controller.broadcaster()),
            controller,
            prom_metrics,
        })
    }
}

/// JSON form of a record as served to clients; terminal records carry a
/// human-readable `summary`.
pub fn snapshot_json(record: &SyncRecord) -> serde_json::Value {
    let mut value = serde_json::json!(record);
    if record.status.is_terminal() {
        value["summary"] = serde_json::json!(record.summary());
    }
    value
}

/// Records HTTP request duration, generates (or propagates) a request ID,
/// and wraps the request in a tracing span.
async fn metrics_middleware(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> axum::response::Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let method = req.method().to_string();
    let raw_path = req.uri().path().to_string();
    let norm_path = normalize_path(&raw_path);
    let start = std::time::Instant::now();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %raw_path,
    );
    let mut response = next.run(req).instrument(span).await;

    state
        .prom_metrics
        .http_request_duration
        .get_or_create(&prom_metrics::HttpLabel {
            method,
            path: norm_path,
        })
        .observe(start.elapsed().as_secs_f64());

    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Collapse sync ids and numeric segments into placeholders so the latency
/// histogram keeps a bounded label set.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|seg| {
            if seg.starts_with("sync_") {
                ":sync_id".to_string()
            } else if !seg.is_empty() && seg.chars().all(|c| c.is_ascii_digit()) {
                ":id".to_string()
            } else {
                seg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(websocket::handler_ws))
        .route("/api/sync", post(routes_sync::handler_sync_start))
        .route("/api/sync/history", get(routes_history::handler_history))
        .route("/api/sync/stats", get(routes_history::handler_stats))
        .route("/api/sync/{sync_id}", get(routes_sync::handler_sync_get))
        .route(
            "/api/sync/{sync_id}/cancel",
            post(routes_sync::handler_sync_cancel),
        )
        .route(
            "/api/sync/{sync_id}/stream",
            get(websocket::handler_sync_stream),
        )
        .route("/healthz", get(routes_health::handler_healthz))
        .route("/readyz", get(routes_health::handler_readyz))
        .route("/metrics", get(routes_health::handler_metrics))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(CatchPanicLayer::new())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(64 * 1024))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .with_state(state)
}

/// Recover orphaned records, then serve until SIGINT/SIGTERM.
pub async fn run(
    port: u16,
    controller: SyncController,
    prom_metrics: Arc<prom_metrics::Metrics>,
) -> Result<()> {
    match controller.recover_interrupted().await {
        Ok(0) => {}
        Ok(n) => warn!(count = n, "recovered interrupted syncs"),
        Err(e) => warn!(error = %e, "crash recovery failed"),
    }
    let state = AppState::new(controller, prom_metrics);
    let app = build_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(port, "sync server running");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("sync server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT, shutting down");
    }
}
