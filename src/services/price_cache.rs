use crate::types::{MarkPrice, Tick};
use dashmap::DashMap;
use std::sync::Arc;

/// Latest traded price per symbol, fed by the live ticker stream.
pub struct MarkCache {
    marks: DashMap<String, MarkPrice>,
}

impl MarkCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a tick. Non-finite or non-positive prices and ticks older than
    /// the stored mark are ignored. Returns whether the mark changed.
    pub fn update(&self, tick: &Tick) -> bool {
        if !tick.price.is_finite() || tick.price <= 0.0 {
            return false;
        }
        let symbol = tick.symbol.to_lowercase();

        let mut entry = self.marks.entry(symbol.clone()).or_insert_with(|| MarkPrice {
            symbol,
            price: tick.price,
            updated_at: tick.timestamp,
        });
        let mark = entry.value_mut();
        if tick.timestamp < mark.updated_at {
            return false;
        }
        mark.price = tick.price;
        mark.updated_at = tick.timestamp;
        true
    }

    pub fn set(&self, symbol: &str, price: f64, timestamp: i64) -> bool {
        self.update(&Tick {
            symbol: symbol.to_string(),
            price,
            timestamp,
        })
    }

    /// Current mark price for `symbol`.
    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.marks.get(&symbol.to_lowercase()).map(|m| m.price)
    }

    pub fn get(&self, symbol: &str) -> Option<MarkPrice> {
        self.marks.get(&symbol.to_lowercase()).map(|m| m.clone())
    }

    /// All marks, sorted by symbol.
    pub fn snapshot(&self) -> Vec<MarkPrice> {
        let mut marks: Vec<MarkPrice> = self.marks.iter().map(|m| m.value().clone()).collect();
        marks.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        marks
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}

impl Default for MarkCache {
    fn default() -> Self {
        Self {
            marks: DashMap::new(),
        }
    }
}
