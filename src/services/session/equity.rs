use super::{normalize_pair, TradingSession};
use crate::types::{EquityPoint, SessionStats};

/// Largest peak-to-trough decline of an equity curve, as a fraction of the
/// running peak.
pub fn max_drawdown(points: &[EquityPoint]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0_f64;
    for point in points {
        peak = peak.max(point.equity);
        if peak > 0.0 {
            worst = worst.max((peak - point.equity) / peak);
        }
    }
    worst
}

impl TradingSession {
    /// Mark-to-market PnL of all open positions. Pairs without a mark are
    /// valued at entry.
    pub fn unrealized_pnl(&self) -> f64 {
        self.positions
            .iter()
            .map(|p| {
                let mark = self.marks.get(&p.pair).copied().unwrap_or(p.entry_price);
                p.unrealized_pnl(mark)
            })
            .sum()
    }

    /// Cash balance plus unrealized PnL.
    pub fn equity(&self) -> f64 {
        self.balance + self.unrealized_pnl()
    }

    pub fn equity_history(&self) -> &[EquityPoint] {
        &self.equity_history
    }

    pub fn peak_equity(&self) -> f64 {
        self.peak_equity
    }

    /// Worst drawdown seen so far.
    pub fn max_drawdown(&self) -> f64 {
        self.max_drawdown
    }

    /// Update the mark for `pair` without a candle (live tick path).
    pub fn mark_price(&mut self, pair: &str, price: f64, timestamp: i64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        self.marks.insert(normalize_pair(pair), price);
        self.clock = self.clock.max(timestamp);
        self.record_equity(timestamp);
    }

    /// Append an equity point if equity moved since the last one.
    pub(crate) fn record_equity(&mut self, timestamp: i64) {
        let equity = self.equity();
        if let Some(last) = self.equity_history.last() {
            if last.equity == equity {
                return;
            }
        }

        self.peak_equity = self.peak_equity.max(equity);
        let drawdown = if self.peak_equity > 0.0 {
            (self.peak_equity - equity) / self.peak_equity
        } else {
            0.0
        };
        self.max_drawdown = self.max_drawdown.max(drawdown);
        self.equity_history.push(EquityPoint {
            timestamp,
            equity,
            drawdown,
        });
    }

    /// Statistics over closed trades.
    pub fn stats(&self) -> SessionStats {
        let trades = self.closed_trades.len();
        let wins = self.closed_trades.iter().filter(|t| t.is_win()).count();
        // Break-even trades count as neither.
        let losses = self.closed_trades.iter().filter(|t| t.is_loss()).count();
        let r_values: Vec<f64> = self
            .closed_trades
            .iter()
            .filter_map(|t| t.r_multiple)
            .collect();

        SessionStats {
            trades,
            wins,
            losses,
            win_rate: if trades > 0 {
                wins as f64 / trades as f64
            } else {
                0.0
            },
            total_net_pnl: self.closed_trades.iter().map(|t| t.net_pnl).sum(),
            total_fees: self.closed_trades.iter().map(|t| t.fees()).sum(),
            average_r: if r_values.is_empty() {
                None
            } else {
                Some(r_values.iter().sum::<f64>() / r_values.len() as f64)
            },
            max_drawdown: self.max_drawdown,
        }
    }
}
