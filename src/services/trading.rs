//! Trading Service
//!
//! Server-side entry point for paper trading:
//! - Opening, closing and re-bracketing positions through the ledger store
//! - Session resets and account/ledger reads
//! - Bracket monitoring on every mark-price tick (system closes)
//! - Account event fan-out over the WebSocket rooms

use crate::services::brackets::ValidationError;
use crate::services::ledger_store::LedgerStore;
use crate::services::price_cache::MarkCache;
use crate::services::session::exit_trigger;
use crate::types::{
    AccountBalanceData, Candle, ClosePositionRequest, ClosedPosition, CreatePositionInput,
    LedgerSummary, OpenedPosition, Position, PositionPnlData, PositionStatus, ServerEvent, Tick,
    TradingAccount, UpdateBracketsRequest,
};
use crate::websocket::RoomManager;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Trading service errors.
#[derive(Debug, Error)]
pub enum TradingError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Insufficient balance: need {needed:.2}, available {available:.2}")]
    InsufficientBalance { needed: f64, available: f64 },

    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("No mark price available for {0}")]
    NoMarkPrice(String),

    #[error("Missing caller identity")]
    Unauthorized,

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl From<rusqlite::Error> for TradingError {
    fn from(e: rusqlite::Error) -> Self {
        TradingError::DatabaseError(e.to_string())
    }
}

/// Paper trading service.
#[derive(Clone)]
pub struct TradingService {
    store: Arc<LedgerStore>,
    marks: Arc<MarkCache>,
    /// Room manager for WebSocket broadcasts (optional for testing)
    room_manager: Option<Arc<RoomManager>>,
}

impl TradingService {
    pub fn new(store: Arc<LedgerStore>, marks: Arc<MarkCache>) -> Self {
        Self {
            store,
            marks,
            room_manager: None,
        }
    }

    /// Create a trading service that publishes account events.
    pub fn with_room_manager(
        store: Arc<LedgerStore>,
        marks: Arc<MarkCache>,
        room_manager: Arc<RoomManager>,
    ) -> Self {
        Self {
            store,
            marks,
            room_manager: Some(room_manager),
        }
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    pub fn marks(&self) -> &Arc<MarkCache> {
        &self.marks
    }

    // ==========================================================================
    // WebSocket Broadcast Helpers
    // ==========================================================================

    fn publish(&self, user_id: &str, event: ServerEvent) {
        if let Some(ref room_manager) = self.room_manager {
            let reached = room_manager.send_to_user(user_id, &event);
            if reached > 0 {
                debug!("Sent {} to {} socket(s) of {}", event.name(), reached, user_id);
            }
        }
    }

    fn broadcast_balance(&self, account: &TradingAccount) {
        self.publish(&account.user_id, balance_event(account));
    }

    fn broadcast_closed(&self, closed: &ClosedPosition) {
        self.publish(
            &closed.position.user_id,
            ServerEvent::PositionClosed {
                position: closed.position.clone(),
            },
        );
        self.broadcast_balance(&closed.account);
    }

    // ==========================================================================
    // Accounts
    // ==========================================================================

    /// Fetch the caller's account, creating it on first use.
    pub fn account(&self, user_id: &str) -> Result<TradingAccount, TradingError> {
        self.store.ensure_trading_account(user_id)
    }

    /// Fetch the account only if it already exists.
    pub fn existing_account(&self, user_id: &str) -> Result<Option<TradingAccount>, TradingError> {
        self.store.get_trading_account(user_id)
    }

    /// Ledger entries together with the running sum and the stored balance.
    pub fn ledger(&self, user_id: &str) -> Result<LedgerSummary, TradingError> {
        let account = self.store.ensure_trading_account(user_id)?;
        Ok(LedgerSummary {
            cash_balance: account.cash_balance,
            ledger_sum: self.store.ledger_balance(user_id)?,
            entries: self.store.list_ledger(user_id)?,
        })
    }

    /// Start the caller's session over from the initial balance.
    pub fn reset_session(&self, user_id: &str) -> Result<TradingAccount, TradingError> {
        let account = self.store.reset_user_session(user_id)?;
        self.broadcast_balance(&account);
        Ok(account)
    }

    // ==========================================================================
    // Positions
    // ==========================================================================

    pub fn open_position(
        &self,
        user_id: &str,
        mut input: CreatePositionInput,
    ) -> Result<OpenedPosition, TradingError> {
        input.user_id = user_id.to_string();
        let opened = self.store.create_position(&input)?;

        self.publish(
            user_id,
            ServerEvent::PositionCreated {
                position: opened.position.clone(),
            },
        );
        self.broadcast_balance(&opened.account);
        Ok(opened)
    }

    /// Close one of the caller's positions. Without an explicit price the
    /// latest mark is used.
    pub fn close_position(
        &self,
        user_id: &str,
        position_id: &str,
        request: ClosePositionRequest,
    ) -> Result<ClosedPosition, TradingError> {
        let price = match request.price {
            Some(price) => price,
            None => {
                let position = self
                    .store
                    .get_position(position_id, Some(user_id))?
                    .ok_or_else(|| TradingError::PositionNotFound(position_id.to_string()))?;
                self.marks
                    .price(&position.symbol)
                    .ok_or(TradingError::NoMarkPrice(position.symbol))?
            }
        };

        let closed = self
            .store
            .close_position_if_open(
                position_id,
                price,
                request.reason.unwrap_or_default(),
                Some(user_id),
            )?
            .ok_or_else(|| TradingError::PositionNotFound(position_id.to_string()))?;

        self.broadcast_closed(&closed);
        Ok(closed)
    }

    pub fn update_brackets(
        &self,
        user_id: &str,
        position_id: &str,
        request: UpdateBracketsRequest,
    ) -> Result<Position, TradingError> {
        self.store
            .update_position_brackets_if_open(
                position_id,
                Some(user_id),
                request.take_profit,
                request.stop_loss,
            )?
            .ok_or_else(|| TradingError::PositionNotFound(position_id.to_string()))
    }

    pub fn list_positions(
        &self,
        user_id: &str,
        status: Option<PositionStatus>,
    ) -> Result<Vec<Position>, TradingError> {
        self.store.list_positions(user_id, status)
    }

    pub fn get_position(&self, user_id: &str, position_id: &str) -> Result<Position, TradingError> {
        self.store
            .get_position(position_id, Some(user_id))?
            .ok_or_else(|| TradingError::PositionNotFound(position_id.to_string()))
    }

    // ==========================================================================
    // Mark prices
    // ==========================================================================

    /// Record a tick and close every bracket it triggers.
    pub fn on_tick(&self, tick: &Tick) -> Vec<ClosedPosition> {
        if !self.marks.update(tick) {
            return Vec::new();
        }
        self.check_position_triggers(&tick.symbol, tick.price, tick.timestamp)
    }

    /// Close open positions on `symbol` whose stop or target `price` has
    /// reached. A position whose stop and target both hold closes at the stop.
    pub fn check_position_triggers(
        &self,
        symbol: &str,
        price: f64,
        timestamp: i64,
    ) -> Vec<ClosedPosition> {
        let positions = match self.store.open_positions_for_symbol(symbol) {
            Ok(positions) => positions,
            Err(e) => {
                warn!("Bracket check for {} failed: {}", symbol, e);
                return Vec::new();
            }
        };

        let candle = Candle::flat(timestamp, price);
        let mut closed = Vec::new();
        for position in positions {
            let Some((reason, exit_price)) =
                exit_trigger(position.side, position.stop_loss, position.take_profit, &candle)
            else {
                continue;
            };

            match self
                .store
                .close_position_if_open(&position.id, exit_price, reason, None)
            {
                Ok(Some(result)) => {
                    info!(
                        "{} hit on {} ({} @ {})",
                        reason, position.id, position.symbol, exit_price
                    );
                    self.broadcast_closed(&result);
                    closed.push(result);
                }
                // Closed concurrently by the owner.
                Ok(None) => {}
                Err(e) => warn!("System close of {} failed: {}", position.id, e),
            }
        }
        closed
    }

    /// Mark-to-market of the user's open positions that have a mark.
    pub fn pnl_snapshots(&self, user_id: &str) -> Result<Vec<PositionPnlData>, TradingError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let positions = self.store.list_open_positions(user_id)?;
        Ok(positions
            .into_iter()
            .filter_map(|p| {
                let mark = self.marks.price(&p.symbol)?;
                Some(PositionPnlData {
                    unrealized_pnl: p.unrealized_pnl(mark),
                    position_id: p.id,
                    symbol: p.symbol,
                    mark_price: mark,
                    timestamp,
                })
            })
            .collect())
    }

    /// Push `position.pnl` for every subscribed user. Returns the number of
    /// events sent.
    pub fn broadcast_pnl(&self) -> usize {
        let Some(ref room_manager) = self.room_manager else {
            return 0;
        };

        let mut sent = 0;
        for user_id in room_manager.subscribed_users() {
            match self.pnl_snapshots(&user_id) {
                Ok(snapshots) => {
                    for data in snapshots {
                        room_manager.send_to_user(&user_id, &ServerEvent::PositionPnl(data));
                        sent += 1;
                    }
                }
                Err(e) => warn!("PnL snapshot for {} failed: {}", user_id, e),
            }
        }
        sent
    }

    /// Consume the live feed until it shuts down.
    pub async fn run_tick_loop(self, mut ticks: broadcast::Receiver<Tick>) {
        loop {
            match ticks.recv().await {
                Ok(tick) => {
                    self.on_tick(&tick);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Tick loop lagged, skipped {} ticks", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Tick stream closed, stopping tick loop");
                    break;
                }
            }
        }
    }

    /// Periodically push unrealized PnL to subscribers.
    pub async fn run_pnl_broadcaster(self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.broadcast_pnl();
        }
    }
}

/// `account.balance` event for an account snapshot.
pub fn balance_event(account: &TradingAccount) -> ServerEvent {
    ServerEvent::AccountBalance(AccountBalanceData {
        user_id: account.user_id.clone(),
        cash_balance: account.cash_balance,
        initial_balance: account.initial_balance,
        timestamp: account.updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fees::FeeSchedule;
    use crate::types::{CloseReason, PositionSide};
    use tokio::sync::mpsc;

    fn service() -> (TradingService, Arc<RoomManager>) {
        let store = Arc::new(LedgerStore::new_in_memory(FeeSchedule::default(), 10_000.0).unwrap());
        let rooms = RoomManager::new();
        (
            TradingService::with_room_manager(store, MarkCache::new(), rooms.clone()),
            rooms,
        )
    }

    fn long_btc(stop_loss: Option<f64>, take_profit: Option<f64>) -> CreatePositionInput {
        CreatePositionInput {
            user_id: String::new(),
            symbol: "btcusdt".to_string(),
            side: PositionSide::Long,
            quantity: 0.1,
            entry_price: 50_000.0,
            take_profit,
            stop_loss,
        }
    }

    fn tick(price: f64, timestamp: i64) -> Tick {
        Tick {
            symbol: "btcusdt".to_string(),
            price,
            timestamp,
        }
    }

    #[test]
    fn test_close_without_price_uses_mark() {
        let (service, _) = service();
        let opened = service.open_position("alice", long_btc(None, None)).unwrap();

        let err = service
            .close_position("alice", &opened.position.id, ClosePositionRequest::default())
            .unwrap_err();
        assert!(matches!(err, TradingError::NoMarkPrice(_)));

        service.marks().set("btcusdt", 51_000.0, 1);
        let closed = service
            .close_position("alice", &opened.position.id, ClosePositionRequest::default())
            .unwrap();
        assert_eq!(closed.position.close_price, Some(51_000.0));
        assert_eq!(closed.position.close_reason, Some(CloseReason::Manual));
    }

    #[test]
    fn test_tick_triggers_stop_loss() {
        let (service, _) = service();
        let opened = service
            .open_position("alice", long_btc(Some(49_000.0), Some(52_000.0)))
            .unwrap();

        assert!(service.on_tick(&tick(50_500.0, 1)).is_empty());
        let closed = service.on_tick(&tick(48_900.0, 2));

        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].position.id, opened.position.id);
        assert_eq!(closed[0].position.close_reason, Some(CloseReason::StopLoss));
        assert_eq!(closed[0].position.close_price, Some(49_000.0));
    }

    #[test]
    fn test_tick_triggers_take_profit() {
        let (service, _) = service();
        service
            .open_position("alice", long_btc(Some(49_000.0), Some(52_000.0)))
            .unwrap();

        let closed = service.on_tick(&tick(52_100.0, 1));
        assert_eq!(closed[0].position.close_reason, Some(CloseReason::TakeProfit));
        assert_eq!(closed[0].position.close_price, Some(52_000.0));
    }

    #[test]
    fn test_events_published_to_owner() {
        let (service, rooms) = service();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = rooms.register(tx);
        rooms.subscribe(client, "alice");

        service.open_position("alice", long_btc(None, None)).unwrap();
        service.open_position("bob", long_btc(None, None)).unwrap();

        let first = ServerEvent::decode(&rx.try_recv().unwrap()).unwrap();
        let second = ServerEvent::decode(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(first.name(), "position.created");
        match second {
            ServerEvent::AccountBalance(data) => {
                assert_eq!(data.user_id, "alice");
                assert!((data.cash_balance - 9_998.0).abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_pnl_broadcast_needs_mark() {
        let (service, rooms) = service();
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = rooms.register(tx);
        rooms.subscribe(client, "alice");
        service.open_position("alice", long_btc(None, None)).unwrap();

        assert_eq!(service.broadcast_pnl(), 0);
        service.marks().set("btcusdt", 50_500.0, 1);
        assert_eq!(service.broadcast_pnl(), 1);

        let snapshots = service.pnl_snapshots("alice").unwrap();
        assert!((snapshots[0].unrealized_pnl - 50.0).abs() < 1e-9);
    }
}
