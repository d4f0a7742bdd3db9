use super::{normalize_pair, CandleReport, TradingSession};
use crate::types::{Candle, Tick};
use std::collections::HashMap;

/// Folds ticks into fixed-width OHLC buckets, one open bucket per pair.
#[derive(Debug, Clone)]
pub struct CandleBuilder {
    interval_ms: i64,
    open: HashMap<String, Candle>,
}

impl CandleBuilder {
    pub fn new(interval_ms: i64) -> Self {
        Self {
            interval_ms: interval_ms.max(1),
            open: HashMap::new(),
        }
    }

    fn bucket_start(&self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.interval_ms) * self.interval_ms
    }

    /// Add a tick. Returns the previous bucket for that pair once a tick
    /// lands in a later bucket.
    pub fn push(&mut self, tick: &Tick) -> Option<Candle> {
        if !tick.price.is_finite() || tick.price <= 0.0 {
            return None;
        }
        let bucket = self.bucket_start(tick.timestamp);
        let pair = normalize_pair(&tick.symbol);

        match self.open.get_mut(&pair) {
            Some(current) if current.time == bucket => {
                current.update(tick.price, None);
                None
            }
            // Late ticks for an already-closed bucket are dropped.
            Some(current) if current.time > bucket => None,
            Some(current) => {
                let done = *current;
                *current = Candle::flat(bucket, tick.price);
                Some(done)
            }
            None => {
                self.open.insert(pair, Candle::flat(bucket, tick.price));
                None
            }
        }
    }

    /// Close the open bucket for `pair`, if any.
    pub fn flush(&mut self, pair: &str) -> Option<Candle> {
        self.open.remove(&normalize_pair(pair))
    }

    /// The bucket still being built for `pair`.
    pub fn current(&self, pair: &str) -> Option<&Candle> {
        self.open.get(&normalize_pair(pair))
    }
}

impl TradingSession {
    /// Live-feed entry point: update the mark and, when a bucket completes,
    /// run it through [`TradingSession::on_candle`].
    pub fn apply_tick(&mut self, builder: &mut CandleBuilder, tick: &Tick) -> Option<CandleReport> {
        let completed = builder.push(tick);
        let report = completed.map(|candle| self.on_candle(&tick.symbol, &candle));
        self.mark_price(&tick.symbol, tick.price, tick.timestamp);
        report
    }
}
