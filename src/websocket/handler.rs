use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::CallerId;
use crate::services::trading::balance_event;
use crate::types::{ClientMessage, ServerEvent};
use crate::AppState;

/// WebSocket upgrade handler. The caller is identified the same way as on
/// the REST routes and may only follow their own account.
pub async fn ws_handler(
    caller: CallerId,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, caller))
}

async fn handle_socket(socket: WebSocket, state: AppState, caller: CallerId) {
    let (mut sender, mut receiver) = socket.split();

    // Create a channel for sending messages to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let client_id = state.room_manager.register(tx);
    info!("WebSocket client connected: {} ({})", client_id, caller.as_str());

    // Forward queued events to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                debug!("Received message from {}: {}", client_id, text);
                handle_message(&state, &caller, client_id, &text);
            }
            Ok(Message::Close(_)) => {
                info!("WebSocket client disconnecting: {}", client_id);
                break;
            }
            Ok(Message::Ping(_)) => {
                // Pong is handled automatically by axum
                debug!("Received ping from {}", client_id);
            }
            Err(e) => {
                error!("WebSocket error for {}: {}", client_id, e);
                break;
            }
            _ => {}
        }
    }

    state.room_manager.unregister(client_id);
    send_task.abort();
    info!("WebSocket client disconnected: {}", client_id);
}

fn handle_message(state: &AppState, caller: &CallerId, client_id: Uuid, text: &str) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            send_error(state, client_id, &format!("Invalid message: {}", e));
            return;
        }
    };

    match msg {
        ClientMessage::Subscribe { user_id } => {
            let user_id = user_id.trim().to_string();
            if user_id.is_empty() {
                send_error(state, client_id, "userId must not be empty");
                return;
            }
            if user_id != caller.as_str() {
                warn!(
                    "Client {} ({}) tried to follow {}",
                    client_id,
                    caller.as_str(),
                    user_id
                );
                send_error(state, client_id, "Cannot subscribe to another user's account");
                return;
            }
            state.room_manager.subscribe(client_id, &user_id);
            debug!("Client {} following account {}", client_id, user_id);
            state.room_manager.send_to_client(
                client_id,
                &ServerEvent::Subscribed {
                    user_id: user_id.clone(),
                },
            );
            send_snapshot(state, client_id, &user_id);
        }
        ClientMessage::Unsubscribe { user_id } => {
            state.room_manager.unsubscribe(client_id, &user_id);
            debug!("Client {} stopped following {}", client_id, user_id);
            state
                .room_manager
                .send_to_client(client_id, &ServerEvent::Unsubscribed { user_id });
        }
    }
}

/// Current balance and open-position PnL, so a new subscriber starts in sync.
/// Reading never creates the account.
fn send_snapshot(state: &AppState, client_id: Uuid, user_id: &str) {
    match state.trading_service.existing_account(user_id) {
        Ok(Some(account)) => state
            .room_manager
            .send_to_client(client_id, &balance_event(&account)),
        Ok(None) => return,
        Err(e) => {
            warn!("Snapshot for {} failed: {}", user_id, e);
            send_error(state, client_id, &e.to_string());
            return;
        }
    }

    if let Ok(snapshots) = state.trading_service.pnl_snapshots(user_id) {
        for data in snapshots {
            state
                .room_manager
                .send_to_client(client_id, &ServerEvent::PositionPnl(data));
        }
    }
}

fn send_error(state: &AppState, client_id: Uuid, error: &str) {
    let msg = ServerEvent::Error {
        error: error.to_string(),
    };
    state.room_manager.send_to_client(client_id, &msg);
}
