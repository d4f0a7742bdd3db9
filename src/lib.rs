//! Paperdesk - paper trading ledger server with live exchange marks

pub mod api;
pub mod config;
pub mod error;
pub mod services;
pub mod sources;
pub mod types;
pub mod websocket;

use axum::{routing::get, Router};
use config::Config;
use services::{MarkCache, TradingService};
use sources::PriceFeed;
use std::sync::Arc;
use websocket::RoomManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub trading_service: TradingService,
    pub room_manager: Arc<RoomManager>,
    pub marks: Arc<MarkCache>,
    /// Live exchange feed; absent when disabled.
    pub feed: Option<PriceFeed>,
}

/// REST routes, the event socket and the JSON 404 fallback, without
/// transport layers.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(api::router())
        .route("/ws", get(websocket::ws_handler))
        .fallback(error::not_found)
        .with_state(state)
}
