use super::Position;
use serde::{Deserialize, Serialize};

/// Incoming WebSocket message from client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to account events for a user
    Subscribe {
        #[serde(rename = "userId")]
        user_id: String,
    },
    /// Stop receiving account events for a user
    Unsubscribe {
        #[serde(rename = "userId")]
        user_id: String,
    },
}

/// Mark-to-market snapshot for one open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionPnlData {
    pub position_id: String,
    pub symbol: String,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub timestamp: i64,
}

/// Authoritative account balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalanceData {
    pub user_id: String,
    pub cash_balance: f64,
    pub initial_balance: f64,
    pub timestamp: i64,
}

/// Outgoing WebSocket event. Also decoded by the client replica, so every
/// variant round-trips through serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "position.created")]
    PositionCreated { position: Position },
    #[serde(rename = "position.closed")]
    PositionClosed { position: Position },
    #[serde(rename = "position.pnl")]
    PositionPnl(PositionPnlData),
    #[serde(rename = "account.balance")]
    AccountBalance(AccountBalanceData),
    #[serde(rename = "subscribed")]
    Subscribed {
        #[serde(rename = "userId")]
        user_id: String,
    },
    #[serde(rename = "unsubscribed")]
    Unsubscribed {
        #[serde(rename = "userId")]
        user_id: String,
    },
    #[serde(rename = "error")]
    Error { error: String },
}

impl ServerEvent {
    /// Decode a frame. Malformed or unknown frames yield `None`.
    pub fn decode(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn encode(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::PositionCreated { .. } => "position.created",
            ServerEvent::PositionClosed { .. } => "position.closed",
            ServerEvent::PositionPnl(_) => "position.pnl",
            ServerEvent::AccountBalance(_) => "account.balance",
            ServerEvent::Subscribed { .. } => "subscribed",
            ServerEvent::Unsubscribed { .. } => "unsubscribed",
            ServerEvent::Error { .. } => "error",
        }
    }
}
