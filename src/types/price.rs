use serde::{Deserialize, Serialize};

/// Normalized price tick emitted by the live feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    /// Lowercase exchange pair, e.g. `btcusdt`.
    pub symbol: String,
    pub price: f64,
    /// Exchange event time (ms).
    pub timestamp: i64,
}

/// Latest known price for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkPrice {
    pub symbol: String,
    pub price: f64,
    pub updated_at: i64,
}
