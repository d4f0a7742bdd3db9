//! Binance public ticker stream.
//!
//! One long-lived connection manager: subscribes every tracked pair on open,
//! treats any inbound frame as liveness, force-drops the socket when the
//! heartbeat window lapses, and reconnects with capped exponential backoff.
//! Each connection attempt gets a new session id; frames and commands that
//! belong to an older session are ignored.

use crate::config::FeedConfig;
use crate::types::Tick;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Connection lifecycle of the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    Disconnected,
    Connecting,
    Connected,
}

/// Binance 24h ticker event. Only the fields used for marks are decoded.
#[derive(Debug, Deserialize)]
struct TickerFrame {
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "E", default)]
    event_time: Option<i64>,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    last_price: String,
}

/// Combined-stream envelope (`/stream?streams=...`).
#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    data: TickerFrame,
}

#[derive(Debug)]
enum FeedCommand {
    Subscribe(Vec<String>),
}

/// `min(base * 2^attempt, max)`.
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}

/// Scale `delay` by a factor in `[1 - jitter, 1 + jitter]` picked by `unit`
/// (in `[0, 1]`), never exceeding `max_ms`.
pub fn apply_jitter(delay: Duration, jitter: f64, unit: f64, max_ms: u64) -> Duration {
    let jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
    let unit = if unit.is_finite() { unit.clamp(0.0, 1.0) } else { 0.5 };
    let factor = 1.0 + jitter * (2.0 * unit - 1.0);
    let ms = (delay.as_millis() as f64 * factor).round().max(0.0) as u64;
    Duration::from_millis(ms.min(max_ms))
}

/// Decode a ticker frame. Anything else (acks, other events, bad prices)
/// yields `None`.
pub fn parse_ticker_frame(text: &str) -> Option<Tick> {
    let frame = serde_json::from_str::<TickerFrame>(text)
        .or_else(|_| serde_json::from_str::<StreamEnvelope>(text).map(|e| e.data))
        .ok()?;
    if frame.event != "24hrTicker" {
        return None;
    }
    let price: f64 = frame.last_price.parse().ok()?;
    if !price.is_finite() || price <= 0.0 {
        return None;
    }
    Some(Tick {
        symbol: frame.symbol.to_lowercase(),
        price,
        timestamp: frame
            .event_time
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
    })
}

/// `SUBSCRIBE` request for the `@ticker` streams of `symbols`.
pub fn subscribe_message(symbols: &[String], id: u64) -> String {
    let params: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@ticker", s.to_lowercase()))
        .collect();
    serde_json::json!({
        "method": "SUBSCRIBE",
        "params": params,
        "id": id,
    })
    .to_string()
}

/// Binance WebSocket price feed.
#[derive(Clone)]
pub struct PriceFeed {
    config: FeedConfig,
    symbols: Arc<RwLock<BTreeSet<String>>>,
    state: Arc<watch::Sender<FeedState>>,
    session: Arc<AtomicU64>,
    request_id: Arc<AtomicU64>,
    /// Command channel of the live connection, tagged with its session.
    commands: Arc<Mutex<Option<(u64, mpsc::UnboundedSender<FeedCommand>)>>>,
    shutdown: Arc<watch::Sender<bool>>,
    tx: broadcast::Sender<Tick>,
}

impl PriceFeed {
    pub fn new(config: FeedConfig) -> (Self, broadcast::Receiver<Tick>) {
        let (tx, rx) = broadcast::channel(1024);
        let symbols = config.symbols.iter().map(|s| s.to_lowercase()).collect();
        let feed = Self {
            config,
            symbols: Arc::new(RwLock::new(symbols)),
            state: Arc::new(watch::channel(FeedState::Disconnected).0),
            session: Arc::new(AtomicU64::new(0)),
            request_id: Arc::new(AtomicU64::new(0)),
            commands: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(watch::channel(false).0),
            tx,
        };
        (feed, rx)
    }

    /// Subscribe to normalized ticks.
    pub fn subscribe_ticks(&self) -> broadcast::Receiver<Tick> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> FeedState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<FeedState> {
        self.state.subscribe()
    }

    /// Id of the current (or most recent) connection attempt.
    pub fn session_id(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    pub async fn symbols(&self) -> Vec<String> {
        self.symbols.read().await.iter().cloned().collect()
    }

    fn set_state(&self, state: FeedState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Feed state {:?} -> {:?}", previous, state);
        }
    }

    /// Track more pairs. New ones are subscribed on the live connection
    /// without reconnecting; returns the pairs that were not tracked yet.
    pub async fn subscribe(&self, symbols: &[String]) -> Vec<String> {
        let added: Vec<String> = {
            let mut tracked = self.symbols.write().await;
            symbols
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty() && tracked.insert(s.clone()))
                .collect()
        };
        if added.is_empty() {
            return added;
        }

        let commands = self.commands.lock().await;
        if let Some((session, tx)) = commands.as_ref() {
            if *session == self.session_id() && tx.send(FeedCommand::Subscribe(added.clone())).is_ok() {
                debug!("Queued live subscribe for {:?}", added);
            }
        }
        added
    }

    /// Cancel any pending reconnect and close the connection.
    pub fn stop(&self) {
        info!("Stopping price feed");
        self.shutdown.send_replace(true);
    }

    /// Connect and keep reconnecting until [`PriceFeed::stop`] is called.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;
            self.set_state(FeedState::Connecting);

            let result = tokio::select! {
                r = self.run_connection(session, &mut attempt) => r,
                _ = shutdown.changed() => break,
            };
            self.set_state(FeedState::Disconnected);
            self.clear_commands(session).await;

            match result {
                Ok(()) => warn!("Price feed disconnected (session {})", session),
                Err(e) => error!("Price feed error (session {}): {}", session, e),
            }

            let delay = apply_jitter(
                backoff_delay(attempt, self.config.backoff_base_ms, self.config.backoff_max_ms),
                self.config.backoff_jitter,
                rand::thread_rng().gen::<f64>(),
                self.config.backoff_max_ms,
            );
            attempt = attempt.saturating_add(1);
            info!("Reconnecting price feed in {:?} (attempt {})", delay, attempt);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        // Invalidate whatever session was last in flight.
        self.session.fetch_add(1, Ordering::SeqCst);
        self.set_state(FeedState::Disconnected);
        info!("Price feed stopped");
        Ok(())
    }

    async fn clear_commands(&self, session: u64) {
        let mut commands = self.commands.lock().await;
        if matches!(*commands, Some((s, _)) if s == session) {
            *commands = None;
        }
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn run_connection(&self, session: u64, attempt: &mut u32) -> anyhow::Result<()> {
        info!("Connecting to {} (session {})", self.config.url, session);
        let (ws_stream, _) = connect_async(self.config.url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        *attempt = 0;
        self.set_state(FeedState::Connected);
        info!("Connected to price feed (session {})", session);

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        *self.commands.lock().await = Some((session, cmd_tx));

        let symbols = self.symbols().await;
        if !symbols.is_empty() {
            let msg = subscribe_message(&symbols, self.next_request_id());
            write.send(Message::Text(msg)).await?;
            debug!("Subscribed to {:?}", symbols);
        }

        let heartbeat = self.config.heartbeat();
        let mut deadline = Instant::now() + heartbeat;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(frame)) => {
                            deadline = Instant::now() + heartbeat;
                            match frame {
                                Message::Text(text) => self.handle_frame(session, &text),
                                Message::Ping(data) => {
                                    write.send(Message::Pong(data)).await?;
                                }
                                Message::Close(_) => {
                                    info!("Price feed closed by server");
                                    break;
                                }
                                _ => {}
                            }
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => break,
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(FeedCommand::Subscribe(symbols)) => {
                            let msg = subscribe_message(&symbols, self.next_request_id());
                            write.send(Message::Text(msg)).await?;
                            info!("Subscribed to {:?} on live connection", symbols);
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    // No graceful close: the stream is dropped on return.
                    warn!("No frame within {:?}, dropping connection", heartbeat);
                    break;
                }
            }
        }

        Ok(())
    }

    fn handle_frame(&self, session: u64, text: &str) {
        if session != self.session_id() {
            return;
        }
        if let Some(tick) = parse_ticker_frame(text) {
            let _ = self.tx.send(tick);
        }
    }
}
