//! Session Types
//!
//! Entities owned by the client-side replica: local positions, resting limit
//! orders, closed-trade snapshots, the timeline and the equity curve.

use super::{CloseReason, PositionSide};
use serde::{Deserialize, Serialize};

/// Order submitted to the local state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderTicket {
    pub pair: String,
    pub side: PositionSide,
    pub qty: f64,
    /// Fill price for market orders, limit price for limit orders.
    pub price: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

impl OrderTicket {
    pub fn new(pair: impl Into<String>, side: PositionSide, qty: f64, price: f64) -> Self {
        Self {
            pair: pair.into(),
            side,
            qty,
            price,
            stop_loss: None,
            take_profit: None,
        }
    }

    pub fn with_stop_loss(mut self, stop_loss: f64) -> Self {
        self.stop_loss = Some(stop_loss);
        self
    }

    pub fn with_take_profit(mut self, take_profit: f64) -> Self {
        self.take_profit = Some(take_profit);
        self
    }
}

/// Open position in the local replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPosition {
    /// Local identifier, stable for the life of the session.
    pub id: String,
    /// Server identifier once the backend acknowledged the position.
    pub backend_id: Option<String>,
    pub pair: String,
    pub side: PositionSide,
    pub qty: f64,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub margin: f64,
    pub open_fee: f64,
    /// Reward-to-risk ratio implied by the brackets at open.
    pub planned_r: Option<f64>,
    /// Dollar risk implied by the stop distance at open.
    pub risk_amount: Option<f64>,
    pub opened_at: i64,
    pub opened_at_index: u64,
    /// Last unrealized PnL pushed by the server, if any.
    pub server_unrealized_pnl: Option<f64>,
}

impl OpenPosition {
    pub fn unrealized_pnl(&self, mark: f64) -> f64 {
        (mark - self.entry_price) * self.qty * self.side.direction()
    }
}

/// Resting limit order, not yet filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrder {
    pub id: String,
    pub pair: String,
    pub side: PositionSide,
    pub qty: f64,
    pub limit_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub created_at_index: u64,
    pub created_at: i64,
}

impl PendingOrder {
    pub fn ticket(&self) -> OrderTicket {
        OrderTicket {
            pair: self.pair.clone(),
            side: self.side,
            qty: self.qty,
            price: self.limit_price,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
        }
    }
}

/// Terminal snapshot of a position. Analytics only; the balance is carried
/// by the session itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedTrade {
    pub id: String,
    pub backend_id: Option<String>,
    pub pair: String,
    pub side: PositionSide,
    pub qty: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub raw_pnl: f64,
    pub open_fee: f64,
    pub close_fee: f64,
    /// `raw_pnl - close_fee`.
    pub net_pnl: f64,
    /// Dollar risk recorded at open; `r_multiple = raw_pnl / risk_amount`.
    pub risk_amount: Option<f64>,
    pub r_multiple: Option<f64>,
    pub planned_r: Option<f64>,
    pub reason: CloseReason,
    pub opened_at: i64,
    pub closed_at: i64,
    pub hold_ms: i64,
    pub hold_candles: u64,
}

impl ClosedTrade {
    /// Total fees paid over the round trip.
    pub fn fees(&self) -> f64 {
        self.open_fee + self.close_fee
    }

    pub fn is_win(&self) -> bool {
        self.net_pnl > 0.0
    }

    pub fn is_loss(&self) -> bool {
        self.net_pnl < 0.0
    }
}

/// Kind of timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    OrderPlaced,
    OrderCancelled,
    OrderFilled,
    OrderRejected,
    PositionOpened,
    PositionClosed,
    BracketsUpdated,
    Reconciled,
}

/// Human-readable session event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    pub timestamp: i64,
    pub kind: TimelineKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pair: Option<String>,
    pub message: String,
}

/// One point of the equity curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquityPoint {
    pub timestamp: i64,
    pub equity: f64,
    /// Fractional drawdown from the running peak at this point.
    pub drawdown: f64,
}

/// Aggregate statistics over closed trades.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub total_net_pnl: f64,
    pub total_fees: f64,
    pub average_r: Option<f64>,
    pub max_drawdown: f64,
}
