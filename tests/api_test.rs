//! HTTP API integration tests
//!
//! Drives the full router with an in-memory ledger and no live feed.

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use paperdesk::api::USER_ID_HEADER;
use paperdesk::config::{Config, FeedConfig};
use paperdesk::services::{FeeSchedule, LedgerStore, MarkCache, TradingService};
use paperdesk::websocket::RoomManager;
use paperdesk::{app, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn test_config(initial_balance: f64) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        database_path: ":memory:".to_string(),
        initial_balance,
        fees: FeeSchedule::default(),
        feed: FeedConfig {
            enabled: false,
            ..FeedConfig::default()
        },
        pnl_broadcast_ms: 1_000,
    }
}

fn test_app_with(initial_balance: f64) -> (Router, Arc<MarkCache>) {
    let config = test_config(initial_balance);
    let store = Arc::new(LedgerStore::new_in_memory(config.fees, initial_balance).unwrap());
    let room_manager = RoomManager::new();
    let marks = MarkCache::new();
    let trading_service =
        TradingService::with_room_manager(store, marks.clone(), room_manager.clone());

    let state = AppState {
        config: Arc::new(config),
        trading_service,
        room_manager,
        marks: marks.clone(),
        feed: None,
    };
    (app(state), marks)
}

fn test_app() -> Router {
    test_app_with(10_000.0).0
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    user: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(USER_ID_HEADER, user);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    // Extractor rejections answer in plain text.
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn btc_long() -> Value {
    json!({
        "symbol": "BTCUSDT",
        "side": "long",
        "quantity": 0.1,
        "entryPrice": 50000.0
    })
}

async fn open(app: &Router, user: &str, body: Value) -> Value {
    let (status, json) = send(app, Method::POST, "/api/positions", Some(user), Some(body)).await;
    assert_eq!(status, StatusCode::CREATED, "{}", json);
    json["data"].clone()
}

// =============================================================================
// Identity
// =============================================================================

mod identity_tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_user_header_is_401() {
        let app = test_app();
        let (status, json) = send(&app, Method::GET, "/api/account", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["code"], "UNAUTHORIZED");

        let (status, _) = send(&app, Method::POST, "/api/positions", None, Some(btc_long())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_event_socket_requires_user_header() {
        let app = test_app();
        let (status, json) = send(&app, Method::GET, "/ws", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_body_user_id_ignored() {
        let app = test_app();
        let mut body = btc_long();
        body["userId"] = json!("mallory");
        let opened = open(&app, "alice", body).await;
        assert_eq!(opened["position"]["userId"], "alice");

        let (_, json) = send(&app, Method::GET, "/api/positions", Some("mallory"), None).await;
        assert_eq!(json["data"].as_array().unwrap().len(), 0);
    }
}

// =============================================================================
// Positions
// =============================================================================

mod position_tests {
    use super::*;

    #[tokio::test]
    async fn test_open_and_close_with_price() {
        let app = test_app();
        let opened = open(&app, "alice", btc_long()).await;
        assert_eq!(opened["position"]["symbol"], "btcusdt");
        assert_eq!(opened["position"]["status"], "open");
        assert!((opened["fee"].as_f64().unwrap() - 2.0).abs() < 1e-9);
        assert!((opened["account"]["cashBalance"].as_f64().unwrap() - 9_998.0).abs() < 1e-9);

        let id = opened["position"]["id"].as_str().unwrap().to_string();
        let (status, json) = send(
            &app,
            Method::POST,
            &format!("/api/positions/{}/close", id),
            Some("alice"),
            Some(json!({ "price": 51000.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["position"]["status"], "closed");
        assert_eq!(json["data"]["position"]["closeReason"], "manual");
        let cash = json["data"]["account"]["cashBalance"].as_f64().unwrap();
        assert!((cash - 10_095.96).abs() < 1e-6);

        // Already closed
        let (status, json) = send(
            &app,
            Method::POST,
            &format!("/api/positions/{}/close", id),
            Some("alice"),
            Some(json!({ "price": 52000.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "POSITION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_close_without_price_uses_mark() {
        let (app, marks) = test_app_with(10_000.0);
        let opened = open(&app, "alice", btc_long()).await;
        let id = opened["position"]["id"].as_str().unwrap().to_string();
        let uri = format!("/api/positions/{}/close", id);

        let (status, json) = send(&app, Method::POST, &uri, Some("alice"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "NO_MARK_PRICE");

        marks.set("btcusdt", 50_500.0, 1);
        let (status, json) = send(&app, Method::POST, &uri, Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["position"]["closePrice"], 50500.0);
    }

    #[tokio::test]
    async fn test_list_with_status_filter() {
        let app = test_app();
        let first = open(&app, "alice", btc_long()).await;
        open(
            &app,
            "alice",
            json!({ "symbol": "ethusdt", "side": "short", "quantity": 1.0, "entryPrice": 3000.0 }),
        )
        .await;
        let id = first["position"]["id"].as_str().unwrap();
        send(
            &app,
            Method::POST,
            &format!("/api/positions/{}/close", id),
            Some("alice"),
            Some(json!({ "price": 50000.0 })),
        )
        .await;

        let (_, all) = send(&app, Method::GET, "/api/positions", Some("alice"), None).await;
        assert_eq!(all["data"].as_array().unwrap().len(), 2);

        let (_, open_only) =
            send(&app, Method::GET, "/api/positions?status=open", Some("alice"), None).await;
        let open_only = open_only["data"].as_array().unwrap();
        assert_eq!(open_only.len(), 1);
        assert_eq!(open_only[0]["symbol"], "ethusdt");

        let (status, _) =
            send(&app, Method::GET, "/api/positions?status=bogus", Some("alice"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_position_scoped_to_owner() {
        let app = test_app();
        let opened = open(&app, "alice", btc_long()).await;
        let uri = format!("/api/positions/{}", opened["position"]["id"].as_str().unwrap());

        let (status, _) = send(&app, Method::GET, &uri, Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, json) = send(&app, Method::GET, &uri, Some("bob"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "POSITION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_update_brackets() {
        let app = test_app();
        let opened = open(&app, "alice", btc_long()).await;
        let uri = format!(
            "/api/positions/{}/brackets",
            opened["position"]["id"].as_str().unwrap()
        );

        let (status, json) = send(
            &app,
            Method::PATCH,
            &uri,
            Some("alice"),
            Some(json!({ "takeProfit": 55000.0, "stopLoss": 48000.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["takeProfit"], 55000.0);
        assert_eq!(json["data"]["stopLoss"], 48000.0);

        let (status, json) = send(
            &app,
            Method::PATCH,
            &uri,
            Some("alice"),
            Some(json!({ "stopLoss": 52000.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_invalid_open_is_400() {
        let app = test_app();
        let (status, json) = send(
            &app,
            Method::POST,
            "/api/positions",
            Some("alice"),
            Some(json!({ "symbol": "btcusdt", "side": "long", "quantity": 0.0, "entryPrice": 50000.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "VALIDATION_ERROR");

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/positions",
            Some("alice"),
            Some(json!({
                "symbol": "btcusdt",
                "side": "long",
                "quantity": 0.1,
                "entryPrice": 50000.0,
                "stopLoss": 51000.0
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_insufficient_balance_is_402() {
        let (app, _) = test_app_with(1.0);
        let (status, json) =
            send(&app, Method::POST, "/api/positions", Some("alice"), Some(btc_long())).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(json["code"], "INSUFFICIENT_BALANCE");
        assert!(json["error"].as_str().unwrap().starts_with("Insufficient balance"));
    }

    #[tokio::test]
    async fn test_unknown_position_is_404() {
        let app = test_app();
        let (status, json) = send(
            &app,
            Method::POST,
            "/api/positions/does-not-exist/close",
            Some("alice"),
            Some(json!({ "price": 1.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "POSITION_NOT_FOUND");
    }
}

// =============================================================================
// Account
// =============================================================================

mod account_tests {
    use super::*;

    #[tokio::test]
    async fn test_account_created_lazily() {
        let app = test_app();
        let (status, json) = send(&app, Method::GET, "/api/account", Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["userId"], "alice");
        assert_eq!(json["data"]["cashBalance"], 10000.0);
        assert_eq!(json["data"]["initialBalance"], 10000.0);
    }

    #[tokio::test]
    async fn test_ledger_sums_to_balance() {
        let app = test_app();
        let opened = open(&app, "alice", btc_long()).await;
        send(
            &app,
            Method::POST,
            &format!("/api/positions/{}/close", opened["position"]["id"].as_str().unwrap()),
            Some("alice"),
            Some(json!({ "price": 49000.0, "reason": "stop_loss" })),
        )
        .await;

        let (status, json) =
            send(&app, Method::GET, "/api/account/ledger", Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        let data = &json["data"];
        let cash = data["cashBalance"].as_f64().unwrap();
        let sum = data["ledgerSum"].as_f64().unwrap();
        assert!((cash - sum).abs() < 1e-9);

        let types: Vec<_> = data["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["entryType"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(types, vec!["init", "open_fee", "close_pnl"]);
    }

    #[tokio::test]
    async fn test_reset() {
        let app = test_app();
        open(&app, "alice", btc_long()).await;
        open(&app, "bob", btc_long()).await;

        let (status, json) =
            send(&app, Method::POST, "/api/account/reset", Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["cashBalance"], 10000.0);

        let (_, alice) = send(&app, Method::GET, "/api/positions", Some("alice"), None).await;
        assert!(alice["data"].as_array().unwrap().is_empty());
        let (_, bob) = send(&app, Method::GET, "/api/positions", Some("bob"), None).await;
        assert_eq!(bob["data"].as_array().unwrap().len(), 1);
    }
}

// =============================================================================
// Misc
// =============================================================================

mod misc_tests {
    use super::*;

    #[tokio::test]
    async fn test_health_without_feed() {
        let app = test_app();
        let (status, json) = send(&app, Method::GET, "/api/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert!(json["feed"].is_null());
        assert_eq!(json["clients"], 0);
    }

    #[tokio::test]
    async fn test_marks_listing() {
        let (app, marks) = test_app_with(10_000.0);
        marks.set("ethusdt", 3_000.0, 5);
        marks.set("btcusdt", 50_000.0, 5);

        let (status, json) = send(&app, Method::GET, "/api/marks", None, None).await;
        assert_eq!(status, StatusCode::OK);
        let data = json["data"].as_array().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0]["symbol"], "btcusdt");
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_404() {
        let app = test_app();
        let (status, json) = send(&app, Method::GET, "/api/nope", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "NOT_FOUND");
    }
}
