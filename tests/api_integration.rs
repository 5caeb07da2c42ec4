//! API integration tests for the dbsync HTTP control surface.
//!
//! Requests go straight to the Axum router through `tower::ServiceExt::oneshot`
//! without binding a TCP listener. The router sits on a real `SyncController`
//! wired to the in-memory fakes from `common`, so admission, conflicts and
//! cancellation are exercised end to end without PostgreSQL.
//!
//! # How to run
//!
//! ```bash
//! cargo test --test api_integration
//! ```
//!
//! The helpers `get()` and `post_json()` return `(StatusCode, Value)` tuples
//! for concise assertions.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{FakeDatabase, FakeDumpTool, Harness, ImportGate};
use dbsync::dashboard::{build_router, AppState};
use dbsync::record::{Direction, Side};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn app(h: &Harness) -> Router {
    build_router(AppState::new(h.controller.clone(), Arc::clone(&h.metrics)))
}

fn harness() -> Harness {
    Harness::new(
        FakeDatabase::populated(Side::Local, 20),
        FakeDatabase::empty(Side::Remote),
    )
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body).unwrap_or(json!(null));
    (status, json)
}

async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body).unwrap_or(json!(null));
    (status, json)
}

/// Poll `GET /api/sync/{id}` until the record is terminal.
async fn wait_terminal(app: &Router, sync_id: &str) -> Value {
    for _ in 0..500 {
        let (status, body) = get(app.clone(), &format!("/api/sync/{}", sync_id)).await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] != "running" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("sync {} never finished", sync_id);
}

// ── Admission ───────────────────────────────────────────────────

#[tokio::test]
async fn start_returns_202_and_sync_runs_to_completion() {
    let h = harness();
    let app = app(&h);

    let (status, body) = post_json(
        app.clone(),
        "/api/sync",
        json!({"direction": "local_to_remote", "triggered_by": "dashboard"}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let sync_id = body["sync_id"].as_str().unwrap().to_string();
    assert!(sync_id.starts_with("sync_"));
    assert_eq!(body["status_url"], format!("/api/sync/{}", sync_id));
    assert_eq!(body["stream_url"], format!("/api/sync/{}/stream", sync_id));

    let record = wait_terminal(&app, &sync_id).await;
    assert_eq!(record["status"], "completed");
    assert_eq!(record["percent_complete"], 100);
    assert_eq!(record["triggered_by"], "dashboard");
    assert_eq!(record["verification_passed"], true);
    assert!(record["summary"].as_str().unwrap().contains("completed"));
}

#[tokio::test]
async fn second_start_while_running_is_409_with_conflicting_id() {
    let local = FakeDatabase::populated(Side::Local, 20);
    let remote = FakeDatabase::populated(Side::Remote, 20);
    let gate = Arc::new(ImportGate::default());
    let tool = FakeDumpTool::new(&local, &remote).with_gate(Arc::clone(&gate));
    let h = Harness::with_tool(local, remote, tool);
    let app = app(&h);

    let (status, first) =
        post_json(app.clone(), "/api/sync", json!({"direction": "local_to_remote"})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    gate.entered.notified().await;

    let (status, body) =
        post_json(app.clone(), "/api/sync", json!({"direction": "remote_to_local"})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["conflicting_sync_id"], first["sync_id"]);
    assert!(body["error"].as_str().unwrap().contains("already running"));

    gate.release.notify_one();
    let record = wait_terminal(&app, first["sync_id"].as_str().unwrap()).await;
    assert_eq!(record["status"], "completed");
}

#[tokio::test]
async fn unknown_direction_is_400() {
    let h = harness();
    let (status, body) =
        post_json(app(&h), "/api/sync", json!({"direction": "sideways"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("sideways"));
    assert!(h.controller.active().is_none());
}

#[tokio::test]
async fn missing_direction_is_rejected() {
    let h = harness();
    let (status, _) = post_json(app(&h), "/api/sync", json!({"dry_run": true})).await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn dry_run_via_api() {
    let h = harness();
    let app = app(&h);
    let (_, body) = post_json(
        app.clone(),
        "/api/sync",
        json!({"direction": "local_to_remote", "dry_run": true}),
    )
    .await;
    let record = wait_terminal(&app, body["sync_id"].as_str().unwrap()).await;
    assert_eq!(record["status"], "completed");
    assert_eq!(record["dry_run"], true);
    assert_eq!(record["current_phase"], "export");
    assert!(h.remote.counts().is_empty());
}

// ── Snapshots and cancellation ──────────────────────────────────

#[tokio::test]
async fn unknown_sync_is_404() {
    let h = harness();
    let (status, body) = get(app(&h), "/api/sync/sync_20240101T000000_00000000").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "sync not found");
}

#[tokio::test]
async fn cancel_unknown_is_404_and_finished_is_409() {
    let h = harness();
    let app = app(&h);

    let (status, _) = post_json(app.clone(), "/api/sync/sync_missing/cancel", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let record = h.run(Direction::LocalToRemote).await;
    let (status, body) = post_json(
        app.clone(),
        &format!("/api/sync/{}/cancel", record.sync_id),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("completed"));
}

#[tokio::test]
async fn cancel_running_sync_via_api() {
    let local = FakeDatabase::populated(Side::Local, 20);
    let remote = FakeDatabase::populated(Side::Remote, 7);
    let gate = Arc::new(ImportGate::default());
    let tool = FakeDumpTool::new(&local, &remote).with_gate(Arc::clone(&gate));
    let h = Harness::with_tool(local, remote, tool);
    let before = h.remote.counts();
    let app = app(&h);

    let (_, body) =
        post_json(app.clone(), "/api/sync", json!({"direction": "local_to_remote"})).await;
    let sync_id = body["sync_id"].as_str().unwrap().to_string();
    gate.entered.notified().await;

    let (status, body) =
        post_json(app.clone(), &format!("/api/sync/{}/cancel", sync_id), json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["cancel_requested"], true);
    gate.release.notify_one();

    let record = wait_terminal(&app, &sync_id).await;
    assert_eq!(record["status"], "cancelled");
    assert_eq!(h.remote.counts(), before);
}

// ── History ─────────────────────────────────────────────────────

#[tokio::test]
async fn history_json_pages_and_filters() {
    let h = harness();
    h.run(Direction::LocalToRemote).await;
    h.run(Direction::LocalToRemote).await;
    h.remote.state().reachable = false;
    h.run(Direction::RemoteToLocal).await;
    let app = app(&h);

    let (status, body) = get(app.clone(), "/api/sync/history?per_page=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(body["per_page"], 2);
    assert_eq!(body["records"].as_array().unwrap().len(), 2);

    let (_, body) = get(app.clone(), "/api/sync/history?status=failed").await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["records"][0]["direction"], "remote_to_local");
    assert!(body["records"][0]["summary"].as_str().is_some());

    let (_, body) = get(app.clone(), "/api/sync/history?direction=local_to_remote").await;
    assert_eq!(body["total"], 2);

    let (status, _) = get(app.clone(), "/api/sync/history?status=exploded").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn history_csv_export() {
    let h = harness();
    h.run(Direction::LocalToRemote).await;
    h.run(Direction::LocalToRemote).await;

    let response = app(&h)
        .oneshot(
            Request::builder()
                .uri("/api/sync/history?format=csv")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/csv");
    assert!(response.headers()["content-disposition"]
        .to_str()
        .unwrap()
        .contains("sync_history.csv"));
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert!(lines[0].starts_with("sync_id,direction,status"));
    assert_eq!(lines.len(), 3);
}

#[tokio::test]
async fn stats_summarize_outcomes() {
    let h = harness();
    h.run(Direction::LocalToRemote).await;
    h.remote.state().reachable = false;
    h.run(Direction::LocalToRemote).await;

    let (status, body) = get(app(&h), "/api/sync/stats?window_days=7").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["window_days"], 7);
    assert_eq!(body["total"], 2);
    assert_eq!(body["completed"], 1);
    assert_eq!(body["failed"], 1);
}

// ── Health and middleware ───────────────────────────────────────

#[tokio::test]
async fn health_endpoints() {
    let h = harness();
    let app = app(&h);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn metrics_endpoint_reports_syncs() {
    let h = harness();
    h.run(Direction::LocalToRemote).await;

    let response = app(&h)
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("dbsync_syncs_started_total{direction=\"local_to_remote\"} 1"));
    assert!(text.contains("dbsync_syncs_finished_total"));
}

#[tokio::test]
async fn request_id_is_generated_or_propagated() {
    let h = harness();
    let app = app(&h);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(response.headers().contains_key("x-request-id"));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .header("x-request-id", "req-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers()["x-request-id"], "req-123");
}

#[tokio::test]
async fn cors_headers_present() {
    let h = harness();
    let response = app(&h)
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .header("origin", "http://localhost:3000")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(response
        .headers()
        .contains_key("access-control-allow-origin"));
}
