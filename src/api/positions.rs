//! Positions API
//!
//! - POST /api/positions - Open a position
//! - GET /api/positions?status=open|closed - List the caller's positions
//! - GET /api/positions/:id - Get one position
//! - POST /api/positions/:id/close - Close at a price (or the latest mark)
//! - PATCH /api/positions/:id/brackets - Replace take-profit/stop-loss

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;

use super::{ApiResponse, CallerId};
use crate::services::TradingError;
use crate::types::{
    ClosePositionRequest, ClosedPosition, CreatePositionInput, OpenedPosition, Position,
    PositionStatus, UpdateBracketsRequest,
};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(open_position).get(list_positions))
        .route("/:id", get(get_position))
        .route("/:id/close", post(close_position))
        .route("/:id/brackets", patch(update_brackets))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListPositionsQuery {
    pub status: Option<PositionStatus>,
}

/// POST /api/positions
async fn open_position(
    State(state): State<AppState>,
    caller: CallerId,
    Json(input): Json<CreatePositionInput>,
) -> Result<(StatusCode, Json<ApiResponse<OpenedPosition>>), TradingError> {
    let opened = state.trading_service.open_position(caller.as_str(), input)?;
    Ok((StatusCode::CREATED, Json(ApiResponse { data: opened })))
}

/// GET /api/positions
async fn list_positions(
    State(state): State<AppState>,
    caller: CallerId,
    Query(query): Query<ListPositionsQuery>,
) -> Result<Json<ApiResponse<Vec<Position>>>, TradingError> {
    let positions = state
        .trading_service
        .list_positions(caller.as_str(), query.status)?;
    Ok(Json(ApiResponse { data: positions }))
}

/// GET /api/positions/:id
async fn get_position(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Position>>, TradingError> {
    let position = state.trading_service.get_position(caller.as_str(), &id)?;
    Ok(Json(ApiResponse { data: position }))
}

/// POST /api/positions/:id/close
///
/// The body is optional; without a price the latest mark is used.
async fn close_position(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
    body: Option<Json<ClosePositionRequest>>,
) -> Result<Json<ApiResponse<ClosedPosition>>, TradingError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let closed = state
        .trading_service
        .close_position(caller.as_str(), &id, request)?;
    Ok(Json(ApiResponse { data: closed }))
}

/// PATCH /api/positions/:id/brackets
async fn update_brackets(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
    Json(request): Json<UpdateBracketsRequest>,
) -> Result<Json<ApiResponse<Position>>, TradingError> {
    let position = state
        .trading_service
        .update_brackets(caller.as_str(), &id, request)?;
    Ok(Json(ApiResponse { data: position }))
}
