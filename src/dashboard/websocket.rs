//! WebSocket handlers — push record snapshots as the controller publishes them.
//!
//! Every message is a full `SyncRecord` snapshot, so a client that reconnects
//! (or lags behind the channel) converges by taking the latest message.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;

use super::{snapshot_json, AppState};
use crate::record::SyncRecord;

const KEEPALIVE: Duration = Duration::from_secs(15);

fn encode(record: &SyncRecord) -> Option<String> {
    serde_json::to_string(&snapshot_json(record)).ok()
}

/// `GET /ws` — Every update of every sync.
pub(super) async fn handler_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let rx = state.broadcaster.subscribe_all();
    ws.on_upgrade(|socket| firehose_loop(socket, rx))
}

async fn firehose_loop(mut socket: WebSocket, mut rx: Receiver<SyncRecord>) {
    let mut keepalive = tokio::time::interval(KEEPALIVE);
    keepalive.tick().await;

    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            result = rx.recv() => {
                match result {
                    Ok(record) => {
                        if let Some(msg) = encode(&record) {
                            if socket.send(Message::Text(msg.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}

/// `GET /api/sync/{sync_id}/stream` — Updates for one sync.
///
/// Subscribes before reading the stored snapshot so no update published in
/// between is lost. Sends the snapshot first, then each update, and closes
/// after the terminal one.
pub(super) async fn handler_sync_stream(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(sync_id): Path<String>,
) -> axum::response::Response {
    let rx = state.broadcaster.subscribe(&sync_id);
    match state.store.get(&sync_id).await {
        Ok(Some(snapshot)) => ws
            .on_upgrade(move |socket| sync_stream_loop(socket, state, snapshot, rx))
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "sync not found"})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn sync_stream_loop(
    mut socket: WebSocket,
    state: Arc<AppState>,
    snapshot: SyncRecord,
    mut rx: Receiver<SyncRecord>,
) {
    let sync_id = snapshot.sync_id.clone();
    if !send_record(&mut socket, &snapshot).await || snapshot.status.is_terminal() {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let mut keepalive = tokio::time::interval(KEEPALIVE);
    keepalive.tick().await;

    loop {
        let mut channel_closed = false;
        let next = tokio::select! {
            _ = keepalive.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
                continue;
            }
            result = rx.recv() => match result {
                Ok(record) => Some(record),
                // Skipped updates are superseded by the stored snapshot.
                Err(RecvError::Lagged(_)) => state.store.get(&sync_id).await.ok().flatten(),
                Err(RecvError::Closed) => {
                    channel_closed = true;
                    state.store.get(&sync_id).await.ok().flatten()
                }
            },
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => return,
                    _ => continue,
                }
            }
        };

        let Some(record) = next else { break };
        if !send_record(&mut socket, &record).await {
            return;
        }
        if record.status.is_terminal() || channel_closed {
            break;
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn send_record(socket: &mut WebSocket, record: &SyncRecord) -> bool {
    match encode(record) {
        Some(msg) => socket.send(Message::Text(msg.into())).await.is_ok(),
        None => true,
    }
}
