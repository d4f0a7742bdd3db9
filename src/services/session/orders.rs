use super::{normalize_pair, EngineError, TradingSession};
use crate::services::brackets::{validate_brackets, validate_order, ValidationError};
use crate::services::fees::{notional, BALANCE_EPSILON};
use crate::types::{
    CloseReason, ClosedTrade, OpenPosition, OrderTicket, PendingOrder, PositionSide, TimelineKind,
};
use tracing::debug;

/// Reward-to-risk ratio of a bracketed entry. `None` unless both brackets are
/// set and both distances are positive.
pub(crate) fn planned_r(
    side: PositionSide,
    entry: f64,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
) -> Option<f64> {
    let (sl, tp) = (stop_loss?, take_profit?);
    let dir = side.direction();
    let risk = (entry - sl) * dir;
    let reward = (tp - entry) * dir;
    if risk > 0.0 && reward > 0.0 {
        Some(reward / risk)
    } else {
        None
    }
}

/// Dollar risk implied by the stop distance, if any.
pub(crate) fn risk_amount(entry: f64, qty: f64, stop_loss: Option<f64>) -> Option<f64> {
    let risk = (entry - stop_loss?).abs() * qty;
    if risk.is_finite() && risk > 0.0 {
        Some(risk)
    } else {
        None
    }
}

impl TradingSession {
    /// Margin held by open positions and resting orders, optionally leaving
    /// out one pending order (the one currently being filled).
    pub fn used_margin(&self, exclude_order: Option<&str>) -> f64 {
        let positions: f64 = self.positions.iter().map(|p| p.margin).sum();
        let pending: f64 = self
            .pending_orders
            .iter()
            .filter(|o| Some(o.id.as_str()) != exclude_order)
            .map(|o| self.fees.quote(o.limit_price, o.qty).margin)
            .sum();
        positions + pending
    }

    /// Cash not reserved as margin.
    pub fn available_balance(&self) -> f64 {
        self.balance - self.used_margin(None)
    }

    /// Open a position immediately at `ticket.price`.
    pub fn open_position(&mut self, ticket: OrderTicket) -> Result<OpenPosition, EngineError> {
        let index = self.candle_index;
        self.open_internal(&ticket, None, index)
    }

    pub(crate) fn open_internal(
        &mut self,
        ticket: &OrderTicket,
        exclude_order: Option<&str>,
        index: u64,
    ) -> Result<OpenPosition, EngineError> {
        if ticket.pair.trim().is_empty() {
            return Err(ValidationError::EmptySymbol.into());
        }
        validate_order(ticket.qty, ticket.price)?;
        validate_brackets(ticket.side, ticket.price, ticket.stop_loss, ticket.take_profit)?;

        let cost = self.fees.quote(ticket.price, ticket.qty);
        let available = self.balance - self.used_margin(exclude_order);
        if cost.required() > available + BALANCE_EPSILON {
            return Err(EngineError::InsufficientBalance {
                needed: cost.required(),
                available,
            });
        }

        let now = self.now();
        let position = OpenPosition {
            id: uuid::Uuid::new_v4().to_string(),
            backend_id: None,
            pair: normalize_pair(&ticket.pair),
            side: ticket.side,
            qty: ticket.qty,
            entry_price: ticket.price,
            stop_loss: ticket.stop_loss,
            take_profit: ticket.take_profit,
            margin: cost.margin,
            open_fee: cost.fee,
            planned_r: planned_r(ticket.side, ticket.price, ticket.stop_loss, ticket.take_profit),
            risk_amount: risk_amount(ticket.price, ticket.qty, ticket.stop_loss),
            opened_at: now,
            opened_at_index: index,
            server_unrealized_pnl: None,
        };

        self.balance -= cost.fee;
        self.positions.push(position.clone());
        self.push_event(
            TimelineKind::PositionOpened,
            Some(&position.pair),
            format!(
                "Opened {} {} {} @ {} (fee {:.2})",
                position.side, position.qty, position.pair, position.entry_price, cost.fee
            ),
        );
        debug!("Opened local position {} on {}", position.id, position.pair);
        self.record_equity(now);

        Ok(position)
    }

    /// Queue a limit order. Its margin is reserved until it fills or is
    /// cancelled.
    pub fn place_limit_order(&mut self, ticket: OrderTicket) -> Result<PendingOrder, EngineError> {
        if ticket.pair.trim().is_empty() {
            return Err(ValidationError::EmptySymbol.into());
        }
        validate_order(ticket.qty, ticket.price)?;
        validate_brackets(ticket.side, ticket.price, ticket.stop_loss, ticket.take_profit)?;

        let cost = self.fees.quote(ticket.price, ticket.qty);
        let available = self.available_balance();
        if cost.required() > available + BALANCE_EPSILON {
            return Err(EngineError::InsufficientBalance {
                needed: cost.required(),
                available,
            });
        }

        let order = PendingOrder {
            id: uuid::Uuid::new_v4().to_string(),
            pair: normalize_pair(&ticket.pair),
            side: ticket.side,
            qty: ticket.qty,
            limit_price: ticket.price,
            stop_loss: ticket.stop_loss,
            take_profit: ticket.take_profit,
            created_at_index: self.candle_index,
            created_at: self.now(),
        };

        self.pending_orders.push(order.clone());
        self.push_event(
            TimelineKind::OrderPlaced,
            Some(&order.pair),
            format!(
                "Limit {} {} {} @ {}",
                order.side, order.qty, order.pair, order.limit_price
            ),
        );
        Ok(order)
    }

    /// Remove a resting order.
    pub fn cancel_order(&mut self, order_id: &str) -> Result<PendingOrder, EngineError> {
        let idx = self
            .pending_orders
            .iter()
            .position(|o| o.id == order_id)
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;
        let order = self.pending_orders.remove(idx);
        self.push_event(
            TimelineKind::OrderCancelled,
            Some(&order.pair),
            format!("Cancelled limit {} {} @ {}", order.side, order.pair, order.limit_price),
        );
        Ok(order)
    }

    /// Close a position at `exit_price` and credit the net PnL.
    pub fn close_position(
        &mut self,
        position_id: &str,
        exit_price: f64,
        reason: CloseReason,
    ) -> Result<ClosedTrade, EngineError> {
        if !exit_price.is_finite() || exit_price <= 0.0 {
            return Err(ValidationError::InvalidPrice(exit_price).into());
        }
        let idx = self
            .positions
            .iter()
            .position(|p| p.id == position_id)
            .ok_or_else(|| EngineError::PositionNotFound(position_id.to_string()))?;

        let position = self.positions.remove(idx);
        let now = self.now();
        let trade = self.settle(position, exit_price, reason, now);
        self.balance += trade.net_pnl;

        self.push_event(
            TimelineKind::PositionClosed,
            Some(&trade.pair),
            format!(
                "Closed {} {} @ {} ({}) net {:.2}",
                trade.side, trade.pair, trade.exit_price, trade.reason, trade.net_pnl
            ),
        );
        self.closed_trades.push(trade.clone());
        self.record_equity(now);

        Ok(trade)
    }

    /// Close at the latest mark for the position's pair.
    pub fn close_at_market(&mut self, position_id: &str) -> Result<ClosedTrade, EngineError> {
        let pair = self
            .position(position_id)
            .map(|p| p.pair.clone())
            .ok_or_else(|| EngineError::PositionNotFound(position_id.to_string()))?;
        let mark = self
            .mark(&pair)
            .ok_or_else(|| EngineError::NoMarkPrice(pair.clone()))?;
        self.close_position(position_id, mark, CloseReason::Manual)
    }

    /// Replace both brackets of an open position.
    pub fn update_brackets(
        &mut self,
        position_id: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<OpenPosition, EngineError> {
        let position = self
            .positions
            .iter_mut()
            .find(|p| p.id == position_id)
            .ok_or_else(|| EngineError::PositionNotFound(position_id.to_string()))?;
        validate_brackets(position.side, position.entry_price, stop_loss, take_profit)?;

        position.stop_loss = stop_loss;
        position.take_profit = take_profit;
        let updated = position.clone();

        self.push_event(
            TimelineKind::BracketsUpdated,
            Some(&updated.pair),
            format!(
                "Brackets on {}: SL {:?} TP {:?}",
                updated.pair, updated.stop_loss, updated.take_profit
            ),
        );
        Ok(updated)
    }

    /// Build the closed-trade snapshot for a position leaving the open set.
    pub(crate) fn settle(
        &self,
        position: OpenPosition,
        exit_price: f64,
        reason: CloseReason,
        closed_at: i64,
    ) -> ClosedTrade {
        let raw_pnl = (exit_price - position.entry_price) * position.qty * position.side.direction();
        let close_fee = self.fees.fee(notional(exit_price, position.qty));
        let net_pnl = raw_pnl - close_fee;

        ClosedTrade {
            id: position.id,
            backend_id: position.backend_id,
            pair: position.pair,
            side: position.side,
            qty: position.qty,
            entry_price: position.entry_price,
            exit_price,
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
            raw_pnl,
            open_fee: position.open_fee,
            close_fee,
            net_pnl,
            risk_amount: position.risk_amount,
            r_multiple: position.risk_amount.map(|risk| raw_pnl / risk),
            planned_r: position.planned_r,
            reason,
            opened_at: position.opened_at,
            closed_at,
            hold_ms: (closed_at - position.opened_at).max(0),
            hold_candles: self.candle_index.saturating_sub(position.opened_at_index),
        }
    }
}
