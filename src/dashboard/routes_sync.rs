//! Sync admission, snapshot and cancellation handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use super::{snapshot_json, AppState};
use crate::controller::{CancelError, SyncRequest};
use crate::error::SyncError;
use crate::record::Direction;

#[derive(Deserialize)]
pub(super) struct StartSyncBody {
    direction: String,
    #[serde(default)]
    dry_run: bool,
    triggered_by: Option<String>,
}

fn error_response(status: StatusCode, message: impl ToString) -> axum::response::Response {
    (status, Json(serde_json::json!({"error": message.to_string()}))).into_response()
}

/// `POST /api/sync` — Admit a sync and run it in the background.
///
/// 202 `{sync_id}` on admission; 409 `{error, conflicting_sync_id}` when
/// another sync holds the token; 400 on an unknown direction.
pub(super) async fn handler_sync_start(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartSyncBody>,
) -> impl IntoResponse {
    let direction: Direction = match body.direction.parse() {
        Ok(d) => d,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let request = SyncRequest {
        direction,
        dry_run: body.dry_run,
        triggered_by: body.triggered_by.unwrap_or_else(|| "api".to_string()),
    };
    match state.controller.start(request).await {
        Ok(started) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "sync_id": started.sync_id,
                "status_url": format!("/api/sync/{}", started.sync_id),
                "stream_url": format!("/api/sync/{}/stream", started.sync_id),
            })),
        )
            .into_response(),
        Err(SyncError::SyncInProgress { active_sync_id }) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": "a sync is already running",
                "conflicting_sync_id": active_sync_id,
            })),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// `GET /api/sync/{sync_id}` — Current record snapshot, the polling channel.
pub(super) async fn handler_sync_get(
    State(state): State<Arc<AppState>>,
    Path(sync_id): Path<String>,
) -> impl IntoResponse {
    match state.store.get(&sync_id).await {
        Ok(Some(record)) => Json(snapshot_json(&record)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "sync not found"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// `POST /api/sync/{sync_id}/cancel` — Takes effect at the next phase boundary.
pub(super) async fn handler_sync_cancel(
    State(state): State<Arc<AppState>>,
    Path(sync_id): Path<String>,
) -> impl IntoResponse {
    match state.controller.cancel(&sync_id).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"sync_id": sync_id, "cancel_requested": true})),
        )
            .into_response(),
        Err(e @ CancelError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, e),
        Err(e @ (CancelError::AlreadyFinished(..) | CancelError::NotOwned(_))) => {
            error_response(StatusCode::CONFLICT, e)
        }
        Err(e @ CancelError::Store(_)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}
