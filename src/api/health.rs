use crate::sources::FeedState;
use crate::types::MarkPrice;
use crate::AppState;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use super::ApiResponse;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    /// `None` when the live feed is disabled.
    feed: Option<FeedState>,
    marks: usize,
    clients: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        feed: state.feed.as_ref().map(|f| f.state()),
        marks: state.marks.len(),
        clients: state.room_manager.client_count(),
    })
}

/// Latest mark for every symbol seen on the feed.
async fn marks(State(state): State<AppState>) -> Json<ApiResponse<Vec<MarkPrice>>> {
    Json(ApiResponse {
        data: state.marks.snapshot(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/marks", get(marks))
}
