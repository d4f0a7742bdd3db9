use serde::{Deserialize, Serialize};

/// OHLC (Open, High, Low, Close) candle for one pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket start time (ms).
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

impl Candle {
    pub fn new(time: i64, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume: None,
        }
    }

    /// Candle whose four prices are all `price`.
    pub fn flat(time: i64, price: f64) -> Self {
        Self::new(time, price, price, price, price)
    }

    /// Fold another traded price into the candle.
    pub fn update(&mut self, price: f64, volume: Option<f64>) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        if let Some(v) = volume {
            self.volume = Some(self.volume.unwrap_or(0.0) + v);
        }
    }
}
