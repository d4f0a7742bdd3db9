use super::orders::{planned_r, risk_amount};
use super::{normalize_pair, EngineError, TradingSession};
use crate::services::fees::notional;
use crate::types::{
    CloseReason, ClosedTrade, OpenPosition, Position, ServerEvent, TimelineKind,
};
use tracing::debug;

/// How an authoritative event was merged into the local copy.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// A local position without a backend id was matched and bound.
    Bound { local_id: String },
    /// The server knew a position the replica did not.
    Inserted { local_id: String },
    /// An open local position was closed on the server's terms.
    Closed { local_id: String },
    /// A locally closed trade was overwritten with the server's settlement.
    Corrected { local_id: String },
    MarkUpdated,
    BalanceSynced,
    /// Already applied, unknown, or not an account event.
    Ignored,
}

impl TradingSession {
    /// Attach the server identifier to a local position after a successful
    /// create call.
    pub fn bind_backend_id(&mut self, local_id: &str, backend_id: &str) -> Result<(), EngineError> {
        let position = self
            .positions
            .iter_mut()
            .find(|p| p.id == local_id)
            .ok_or_else(|| EngineError::PositionNotFound(local_id.to_string()))?;
        position.backend_id = Some(backend_id.to_string());
        Ok(())
    }

    /// Merge an authoritative server event. Applying the same event twice has
    /// the same effect as applying it once.
    pub fn apply_server_event(&mut self, event: &ServerEvent) -> ReconcileOutcome {
        match event {
            ServerEvent::PositionCreated { position } => self.reconcile_created(position),
            ServerEvent::PositionClosed { position } => self.reconcile_closed(position),
            ServerEvent::PositionPnl(data) => {
                if data.mark_price.is_finite() && data.mark_price > 0.0 {
                    self.marks.insert(normalize_pair(&data.symbol), data.mark_price);
                }
                if let Some(p) = self
                    .positions
                    .iter_mut()
                    .find(|p| p.backend_id.as_deref() == Some(data.position_id.as_str()))
                {
                    p.server_unrealized_pnl = Some(data.unrealized_pnl);
                }
                let now = self.now();
                self.record_equity(now);
                ReconcileOutcome::MarkUpdated
            }
            ServerEvent::AccountBalance(data) => {
                if !data.cash_balance.is_finite() {
                    return ReconcileOutcome::Ignored;
                }
                self.balance = data.cash_balance;
                if data.initial_balance.is_finite() {
                    self.initial_balance = data.initial_balance;
                }
                let now = self.now();
                self.record_equity(now);
                ReconcileOutcome::BalanceSynced
            }
            _ => ReconcileOutcome::Ignored,
        }
    }

    fn reconcile_created(&mut self, remote: &Position) -> ReconcileOutcome {
        if !remote.is_open() {
            return self.reconcile_closed(remote);
        }
        if self
            .positions
            .iter()
            .any(|p| p.backend_id.as_deref() == Some(remote.id.as_str()))
            || self
                .closed_trades
                .iter()
                .any(|t| t.backend_id.as_deref() == Some(remote.id.as_str()))
        {
            return ReconcileOutcome::Ignored;
        }

        // Oldest optimistic open that matches the server row.
        let pair = normalize_pair(&remote.symbol);
        if let Some(local) = self.positions.iter_mut().find(|p| {
            p.backend_id.is_none()
                && p.pair == pair
                && p.side == remote.side
                && p.qty == remote.quantity
                && p.entry_price == remote.entry_price
        }) {
            local.backend_id = Some(remote.id.clone());
            debug!("Bound local position {} to {}", local.id, remote.id);
            return ReconcileOutcome::Bound {
                local_id: local.id.clone(),
            };
        }

        let cost = self.fees.quote(remote.entry_price, remote.quantity);
        let position = OpenPosition {
            id: uuid::Uuid::new_v4().to_string(),
            backend_id: Some(remote.id.clone()),
            pair,
            side: remote.side,
            qty: remote.quantity,
            entry_price: remote.entry_price,
            stop_loss: remote.stop_loss,
            take_profit: remote.take_profit,
            margin: cost.margin,
            open_fee: cost.fee,
            planned_r: planned_r(remote.side, remote.entry_price, remote.stop_loss, remote.take_profit),
            risk_amount: risk_amount(remote.entry_price, remote.quantity, remote.stop_loss),
            opened_at: remote.created_at,
            opened_at_index: self.candle_index,
            server_unrealized_pnl: None,
        };
        let local_id = position.id.clone();
        self.push_event(
            TimelineKind::Reconciled,
            Some(&remote.symbol),
            format!("Server opened {} {} {}", remote.side, remote.quantity, remote.symbol),
        );
        self.positions.push(position);
        ReconcileOutcome::Inserted { local_id }
    }

    fn reconcile_closed(&mut self, remote: &Position) -> ReconcileOutcome {
        let exit_price = remote.close_price.unwrap_or(remote.entry_price);
        let net_pnl = remote.close_pnl.filter(|v| v.is_finite()).unwrap_or(0.0);
        let reason = remote.close_reason.unwrap_or(CloseReason::System);
        let closed_at = remote.closed_at.unwrap_or_else(|| self.now());
        let close_fee = self.fees.fee(notional(exit_price, remote.quantity));

        let backend = Some(remote.id.as_str());
        if let Some(idx) = self.positions.iter().position(|p| p.backend_id.as_deref() == backend) {
            // Server-side close wins; the balance follows via account.balance.
            let position = self.positions.remove(idx);
            let mut trade = self.settle(position, exit_price, reason, closed_at);
            apply_server_settlement(&mut trade, net_pnl, close_fee);
            let local_id = trade.id.clone();
            self.push_event(
                TimelineKind::Reconciled,
                Some(&trade.pair),
                format!("Server closed {} @ {} ({})", trade.pair, exit_price, reason),
            );
            self.closed_trades.push(trade);
            return ReconcileOutcome::Closed { local_id };
        }

        if let Some(trade) = self
            .closed_trades
            .iter_mut()
            .find(|t| t.backend_id.as_deref() == backend)
        {
            let unchanged = trade.exit_price == exit_price
                && trade.net_pnl == net_pnl
                && trade.reason == reason;
            if unchanged {
                return ReconcileOutcome::Ignored;
            }
            trade.exit_price = exit_price;
            trade.reason = reason;
            trade.closed_at = closed_at;
            apply_server_settlement(trade, net_pnl, close_fee);
            let local_id = trade.id.clone();
            let pair = trade.pair.clone();
            self.push_event(
                TimelineKind::Reconciled,
                Some(&pair),
                format!("Server settled {} @ {} ({})", pair, exit_price, reason),
            );
            return ReconcileOutcome::Corrected { local_id };
        }

        ReconcileOutcome::Ignored
    }
}

fn apply_server_settlement(trade: &mut ClosedTrade, net_pnl: f64, close_fee: f64) {
    trade.net_pnl = net_pnl;
    trade.close_fee = close_fee;
    trade.raw_pnl = net_pnl + close_fee;
    trade.r_multiple = trade.risk_amount.map(|risk| trade.raw_pnl / risk);
}
