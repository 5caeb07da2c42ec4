//! History listing, CSV export and stats handlers.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use super::{snapshot_json, AppState};
use crate::history::{to_csv, HistoryFilter, MAX_PER_PAGE};

#[derive(Deserialize)]
pub(super) struct HistoryQuery {
    direction: Option<String>,
    status: Option<String>,
    sort_by: Option<String>,
    sort_dir: Option<String>,
    page: Option<u32>,
    per_page: Option<u32>,
    format: Option<String>,
}

fn bad_request(message: String) -> axum::response::Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": message})),
    )
        .into_response()
}

fn internal_error(e: anyhow::Error) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": e.to_string()})),
    )
        .into_response()
}

/// `GET /api/sync/history?direction=&status=&page=&per_page=&sort_by=&sort_dir=&format=csv`
///
/// JSON returns one page plus the total count. CSV returns every record
/// matching the filter, in the requested order.
pub(super) async fn handler_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryQuery>,
) -> impl IntoResponse {
    let direction = match params.direction.as_deref().filter(|s| !s.is_empty()) {
        Some(s) => match s.parse() {
            Ok(d) => Some(d),
            Err(e) => return bad_request(e),
        },
        None => None,
    };
    let status = match params.status.as_deref().filter(|s| !s.is_empty()) {
        Some(s) => match s.parse() {
            Ok(st) => Some(st),
            Err(e) => return bad_request(e),
        },
        None => None,
    };
    let mut filter = HistoryFilter {
        direction,
        status,
        sort_by: params.sort_by,
        sort_dir: params.sort_dir,
        page: params.page,
        per_page: params.per_page,
    };

    if params.format.as_deref() == Some("csv") {
        filter.per_page = Some(MAX_PER_PAGE);
        filter.page = Some(1);
        let mut records = Vec::new();
        loop {
            let page = match state.store.list(&filter).await {
                Ok(p) => p,
                Err(e) => return internal_error(e),
            };
            let fetched = page.records.len();
            records.extend(page.records);
            if fetched == 0 || records.len() as i64 >= page.total {
                break;
            }
            filter.page = Some(filter.page() + 1);
        }
        return (
            [
                (header::CONTENT_TYPE, "text/csv"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"sync_history.csv\"",
                ),
            ],
            to_csv(&records),
        )
            .into_response();
    }

    match state.store.list(&filter).await {
        Ok(page) => Json(serde_json::json!({
            "records": page.records.iter().map(snapshot_json).collect::<Vec<_>>(),
            "total": page.total,
            "page": page.page,
            "per_page": page.per_page,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
pub(super) struct StatsQuery {
    window_days: Option<i64>,
}

/// `GET /api/sync/stats?window_days=30`
pub(super) async fn handler_stats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsQuery>,
) -> impl IntoResponse {
    let window_days = params.window_days.unwrap_or(30).clamp(1, 3650);
    match state.store.stats(window_days).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal_error(e),
    }
}
