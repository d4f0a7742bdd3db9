use super::{normalize_pair, EngineError, TradingSession};
use crate::types::{Candle, CloseReason, ClosedTrade, OpenPosition, PositionSide, TimelineKind};
use std::collections::HashSet;
use tracing::{debug, info};

/// What a single candle did to the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandleReport {
    /// Positions opened from filled limit orders.
    pub filled: Vec<OpenPosition>,
    /// Orders dropped because the fill was refused, with the reason.
    pub rejected: Vec<(String, EngineError)>,
    /// Positions closed by a stop or target.
    pub exits: Vec<ClosedTrade>,
}

/// A buy limit fills once the low trades through it; a sell limit once the
/// high does.
pub fn limit_fills(side: PositionSide, limit_price: f64, candle: &Candle) -> bool {
    match side {
        PositionSide::Long => candle.low <= limit_price,
        PositionSide::Short => candle.high >= limit_price,
    }
}

/// Bracket exit triggered by `candle`, with the settlement price.
///
/// When stop and target are both inside the candle's range the stop wins:
/// intra-candle order is unknown, so the worst case is assumed.
pub fn exit_trigger(
    side: PositionSide,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
    candle: &Candle,
) -> Option<(CloseReason, f64)> {
    let (stop_hit, target_hit) = match side {
        PositionSide::Long => (
            stop_loss.map_or(false, |sl| candle.low <= sl),
            take_profit.map_or(false, |tp| candle.high >= tp),
        ),
        PositionSide::Short => (
            stop_loss.map_or(false, |sl| candle.high >= sl),
            take_profit.map_or(false, |tp| candle.low <= tp),
        ),
    };

    match (stop_hit, target_hit) {
        (true, _) => stop_loss.map(|sl| (CloseReason::StopLoss, sl)),
        (false, true) => take_profit.map(|tp| (CloseReason::TakeProfit, tp)),
        _ => None,
    }
}

impl TradingSession {
    /// Feed a completed candle for `pair`: fill resting orders, then run
    /// bracket exits on positions that were already open.
    pub fn on_candle(&mut self, pair: &str, candle: &Candle) -> CandleReport {
        let pair = normalize_pair(pair);
        let pair = pair.as_str();
        self.candle_index += 1;
        self.clock = candle.time;
        self.marks.insert(pair.to_string(), candle.close);

        let mut report = CandleReport::default();

        // Positions filled below cannot also exit on this candle.
        let already_open: HashSet<String> = self
            .positions
            .iter()
            .filter(|p| p.pair == pair)
            .map(|p| p.id.clone())
            .collect();

        let due: Vec<_> = self
            .pending_orders
            .iter()
            .filter(|o| o.pair == pair && limit_fills(o.side, o.limit_price, candle))
            .cloned()
            .collect();

        let index = self.candle_index;
        for order in due {
            let result = self.open_internal(&order.ticket(), Some(&order.id), index);
            self.pending_orders.retain(|o| o.id != order.id);
            match result {
                Ok(position) => {
                    self.push_event(
                        TimelineKind::OrderFilled,
                        Some(pair),
                        format!("Limit {} {} filled @ {}", order.side, pair, order.limit_price),
                    );
                    debug!("Filled limit order {} into {}", order.id, position.id);
                    report.filled.push(position);
                }
                Err(e) => {
                    self.push_event(
                        TimelineKind::OrderRejected,
                        Some(pair),
                        format!("Limit {} {} rejected: {}", order.side, pair, e),
                    );
                    info!("Dropped limit order {}: {}", order.id, e);
                    report.rejected.push((order.id, e));
                }
            }
        }

        let triggered: Vec<(String, CloseReason, f64)> = self
            .positions
            .iter()
            .filter(|p| already_open.contains(&p.id))
            .filter_map(|p| {
                exit_trigger(p.side, p.stop_loss, p.take_profit, candle)
                    .map(|(reason, price)| (p.id.clone(), reason, price))
            })
            .collect();

        for (id, reason, price) in triggered {
            if let Ok(trade) = self.close_position(&id, price, reason) {
                report.exits.push(trade);
            }
        }

        self.record_equity(candle.time);
        report
    }
}
