//! Account API
//!
//! - GET /api/account - Fetch (or lazily create) the caller's account
//! - GET /api/account/ledger - Ledger entries with the balance check
//! - POST /api/account/reset - Wipe positions and ledger, restore the balance

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};

use super::{ApiResponse, CallerId};
use crate::services::TradingError;
use crate::types::{LedgerSummary, TradingAccount};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_account))
        .route("/ledger", get(get_ledger))
        .route("/reset", post(reset_account))
}

async fn get_account(
    State(state): State<AppState>,
    caller: CallerId,
) -> Result<Json<ApiResponse<TradingAccount>>, TradingError> {
    let account = state.trading_service.account(caller.as_str())?;
    Ok(Json(ApiResponse { data: account }))
}

async fn get_ledger(
    State(state): State<AppState>,
    caller: CallerId,
) -> Result<Json<ApiResponse<LedgerSummary>>, TradingError> {
    let ledger = state.trading_service.ledger(caller.as_str())?;
    Ok(Json(ApiResponse { data: ledger }))
}

async fn reset_account(
    State(state): State<AppState>,
    caller: CallerId,
) -> Result<Json<ApiResponse<TradingAccount>>, TradingError> {
    let account = state.trading_service.reset_session(caller.as_str())?;
    Ok(Json(ApiResponse { data: account }))
}
