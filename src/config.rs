use crate::services::fees::{FeeSchedule, DEFAULT_FEE_RATE, DEFAULT_LEVERAGE};
use std::env;
use std::time::Duration;

/// Live ticker feed configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    /// Whether to connect to the exchange at all.
    pub enabled: bool,
    /// WebSocket endpoint of the exchange stream.
    pub url: String,
    /// Lowercase exchange pairs subscribed on every connect.
    pub symbols: Vec<String>,
    /// Drop the socket after this long without any frame.
    pub heartbeat_ms: u64,
    /// First reconnect delay; doubles per failed attempt.
    pub backoff_base_ms: u64,
    /// Upper bound on the reconnect delay.
    pub backoff_max_ms: u64,
    /// Multiplicative jitter, e.g. 0.2 for ±20%.
    pub backoff_jitter: f64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "wss://stream.binance.com:9443/ws".to_string(),
            symbols: vec![
                "btcusdt".to_string(),
                "ethusdt".to_string(),
                "solusdt".to_string(),
            ],
            heartbeat_ms: 30_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            backoff_jitter: 0.2,
        }
    }
}

impl FeedConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.max(1))
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// SQLite file holding accounts, positions and the ledger.
    pub database_path: String,
    /// Starting cash for new accounts and after a reset.
    pub initial_balance: f64,
    pub fees: FeeSchedule,
    pub feed: FeedConfig,
    /// Period of the `position.pnl` broadcast.
    pub pnl_broadcast_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let feed_defaults = FeedConfig::default();

        Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3001),
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "paperdesk.db".to_string()),
            initial_balance: env::var("INITIAL_BALANCE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v: &f64| v.is_finite() && *v >= 0.0)
                .unwrap_or(10_000.0),
            fees: FeeSchedule {
                fee_rate: env::var("FEE_RATE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_FEE_RATE),
                leverage: env::var("LEVERAGE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_LEVERAGE),
            },
            feed: FeedConfig {
                enabled: env::var("FEED_ENABLED")
                    .ok()
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(feed_defaults.enabled),
                url: env::var("FEED_URL").unwrap_or(feed_defaults.url),
                symbols: env::var("FEED_SYMBOLS")
                    .ok()
                    .map(|s| parse_symbols(&s))
                    .unwrap_or(feed_defaults.symbols),
                heartbeat_ms: env::var("FEED_HEARTBEAT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(feed_defaults.heartbeat_ms),
                backoff_base_ms: env::var("FEED_BACKOFF_BASE_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(feed_defaults.backoff_base_ms),
                backoff_max_ms: env::var("FEED_BACKOFF_MAX_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(feed_defaults.backoff_max_ms),
                backoff_jitter: env::var("FEED_BACKOFF_JITTER")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(feed_defaults.backoff_jitter),
            },
            pnl_broadcast_ms: env::var("PNL_BROADCAST_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2_000),
        }
    }

    pub fn pnl_broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.pnl_broadcast_ms.max(100))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Split a comma list of pairs, lowercased, blanks and duplicates removed.
pub fn parse_symbols(raw: &str) -> Vec<String> {
    let mut symbols: Vec<String> = Vec::new();
    for symbol in raw.split(',').map(|s| s.trim().to_lowercase()) {
        if !symbol.is_empty() && !symbols.contains(&symbol) {
            symbols.push(symbol);
        }
    }
    symbols
}
