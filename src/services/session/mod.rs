//! Local trading session.
//!
//! A single-threaded replica of the account ledger that drives the same
//! open/close rules as the server so the UI can react without a round trip.
//! Every operation validates fully before mutating, so a rejected call leaves
//! the session untouched. The server remains authoritative; its events are
//! merged back in through [`TradingSession::apply_server_event`].

mod candles;
mod equity;
mod matching;
mod orders;
mod reconcile;

pub use candles::CandleBuilder;
pub use equity::max_drawdown;
pub use matching::{exit_trigger, limit_fills, CandleReport};
pub use reconcile::ReconcileOutcome;

use crate::services::brackets::ValidationError;
use crate::services::fees::FeeSchedule;
use crate::types::{
    ClosedTrade, EquityPoint, OpenPosition, PendingOrder, TimelineEvent, TimelineKind,
};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

/// Rejections from the local state machine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Insufficient balance: need {needed:.2}, available {available:.2}")]
    InsufficientBalance { needed: f64, available: f64 },

    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("No mark price for {0}")]
    NoMarkPrice(String),
}

/// Pairs are keyed the way the server stores symbols: trimmed, lowercase.
pub(crate) fn normalize_pair(pair: &str) -> String {
    pair.trim().to_lowercase()
}

/// In-memory session state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingSession {
    fees: FeeSchedule,
    initial_balance: f64,
    balance: f64,
    positions: Vec<OpenPosition>,
    pending_orders: Vec<PendingOrder>,
    closed_trades: Vec<ClosedTrade>,
    timeline: Vec<TimelineEvent>,
    equity_history: Vec<EquityPoint>,
    marks: HashMap<String, f64>,
    peak_equity: f64,
    max_drawdown: f64,
    candle_index: u64,
    /// Latest market time observed (ms); 0 until the first candle or tick.
    clock: i64,
}

impl TradingSession {
    /// Start a fresh session with `initial_balance` of virtual cash.
    pub fn new(initial_balance: f64, fees: FeeSchedule) -> Self {
        let mut session = Self {
            fees,
            initial_balance,
            balance: initial_balance,
            positions: Vec::new(),
            pending_orders: Vec::new(),
            closed_trades: Vec::new(),
            timeline: Vec::new(),
            equity_history: Vec::new(),
            marks: HashMap::new(),
            peak_equity: initial_balance,
            max_drawdown: 0.0,
            candle_index: 0,
            clock: 0,
        };
        let now = session.now();
        session.record_equity(now);
        session
    }

    /// Discard everything and start again from the initial balance.
    pub fn reset(&mut self) {
        *self = Self::new(self.initial_balance, self.fees);
    }

    pub fn fees(&self) -> &FeeSchedule {
        &self.fees
    }

    pub fn initial_balance(&self) -> f64 {
        self.initial_balance
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn positions(&self) -> &[OpenPosition] {
        &self.positions
    }

    pub fn position(&self, id: &str) -> Option<&OpenPosition> {
        self.positions.iter().find(|p| p.id == id)
    }

    pub fn pending_orders(&self) -> &[PendingOrder] {
        &self.pending_orders
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed_trades
    }

    pub fn timeline(&self) -> &[TimelineEvent] {
        &self.timeline
    }

    pub fn candle_index(&self) -> u64 {
        self.candle_index
    }

    pub fn mark(&self, pair: &str) -> Option<f64> {
        self.marks.get(&normalize_pair(pair)).copied()
    }

    /// Current time for manually triggered operations: market time when one
    /// has been observed, wall clock otherwise.
    fn now(&self) -> i64 {
        if self.clock > 0 {
            self.clock
        } else {
            chrono::Utc::now().timestamp_millis()
        }
    }

    fn push_event(&mut self, kind: TimelineKind, pair: Option<&str>, message: String) {
        self.timeline.push(TimelineEvent {
            timestamp: self.now(),
            kind,
            pair: pair.map(str::to_string),
            message,
        });
    }
}
