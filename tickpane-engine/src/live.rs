//! Live market-data feed adapter.
//!
//! Implements [`MarketFeed`] against a streaming tick server over
//! WebSocket (auto-reconnect, keepalive pings, status watch channel) and
//! a kline REST endpoint for candle backfill. The adapter only caches the
//! latest tick per subscribed symbol; the engine polls it on its own
//! timers and tolerates silent staleness, so a dropped connection shows
//! up as nothing more than a connectivity indicator.

use crate::feed::{ConnectionState, MarketFeed};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tickpane_core::{Candle, Symbol, Tick, Timeframe};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Tick stream URL from TICKPANE_FEED_WS_URL (default: ws://127.0.0.1:9001)
fn default_ws_url() -> String {
    static URL: OnceLock<String> = OnceLock::new();
    URL.get_or_init(|| {
        std::env::var("TICKPANE_FEED_WS_URL")
            .unwrap_or_else(|_| "ws://127.0.0.1:9001".to_string())
    })
    .clone()
}

/// Kline REST base URL from TICKPANE_FEED_REST_URL
fn default_rest_url() -> String {
    static URL: OnceLock<String> = OnceLock::new();
    URL.get_or_init(|| {
        std::env::var("TICKPANE_FEED_REST_URL")
            .unwrap_or_else(|_| "https://fapi.binance.com".to_string())
    })
    .clone()
}

/// Live feed configuration
#[derive(Debug, Clone)]
pub struct LiveFeedConfig {
    pub ws_url: String,
    pub rest_url: String,
    pub ping_interval: Duration,
    pub reconnect_delay: Duration,
    /// Candle window requested per backfill
    pub backfill_limit: usize,
}

impl Default for LiveFeedConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            rest_url: default_rest_url(),
            ping_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(2),
            backfill_limit: 300,
        }
    }
}

impl LiveFeedConfig {
    pub fn new(ws_url: impl Into<String>, rest_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            rest_url: rest_url.into(),
            ..Default::default()
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_backfill_limit(mut self, limit: usize) -> Self {
        self.backfill_limit = limit;
        self
    }
}

/// Inbound messages from the tick server
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum FeedMessage {
    #[serde(rename = "tick")]
    Tick {
        symbol: String,
        price: f64,
        time: DateTime<Utc>,
    },
    #[serde(rename = "welcome")]
    Welcome {
        #[serde(default)]
        message: Option<String>,
    },
}

/// Outbound subscription frames
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum FeedRequest {
    Subscribe { symbols: Vec<Symbol> },
    Unsubscribe { symbols: Vec<Symbol> },
}

/// Binance-style kline row: open time, OHLCV as strings, close time, rest ignored
#[derive(Debug, Deserialize)]
struct KlineRow(
    i64,    // 0: Open time (ms)
    String, // 1: Open
    String, // 2: High
    String, // 3: Low
    String, // 4: Close
    String, // 5: Volume
    #[serde(default)] serde_json::Value, // 6: Close time
    #[serde(default)] serde_json::Value, // 7: Quote asset volume
    #[serde(default)] serde_json::Value, // 8: Number of trades
    #[serde(default)] serde_json::Value, // 9: Taker buy base volume
    #[serde(default)] serde_json::Value, // 10: Taker buy quote volume
    #[serde(default)] serde_json::Value, // 11: Ignore
);

fn parse_klines(rows: Vec<KlineRow>) -> Vec<Candle> {
    rows.into_iter()
        .filter_map(|row| {
            let open_time = DateTime::from_timestamp_millis(row.0)?;
            Some(Candle {
                open_time,
                open: row.1.parse().ok()?,
                high: row.2.parse().ok()?,
                low: row.3.parse().ok()?,
                close: row.4.parse().ok()?,
                volume: row.5.parse().unwrap_or(0.0),
            })
        })
        .collect()
}

#[derive(Debug, Default)]
struct FeedCache {
    ticks: HashMap<Symbol, Tick>,
    subscribed: BTreeSet<Symbol>,
}

/// WebSocket + REST feed adapter
pub struct LiveFeed {
    config: LiveFeedConfig,
    cache: Arc<Mutex<FeedCache>>,
    status_rx: watch::Receiver<ConnectionState>,
    request_tx: mpsc::UnboundedSender<FeedRequest>,
    client: reqwest::Client,
}

impl LiveFeed {
    /// Spawn the connection loop and return the adapter
    pub fn start(config: LiveFeedConfig) -> Self {
        let cache = Arc::new(Mutex::new(FeedCache::default()));
        let (status_tx, status_rx) = watch::channel(ConnectionState::Reconnecting);
        let (request_tx, request_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_feed_loop(
            config.clone(),
            Arc::clone(&cache),
            status_tx,
            request_rx,
        ));

        Self {
            config,
            cache,
            status_rx,
            request_tx,
            client: reqwest::Client::new(),
        }
    }

    /// Watch channel for connectivity changes, for UI indicators
    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.status_rx.clone()
    }
}

#[async_trait]
impl MarketFeed for LiveFeed {
    async fn subscribe(&self, symbols: &[Symbol]) {
        if symbols.is_empty() {
            return;
        }
        let mut cache = self.cache.lock().await;
        let fresh: Vec<Symbol> = symbols
            .iter()
            .filter(|symbol| cache.subscribed.insert((*symbol).clone()))
            .cloned()
            .collect();
        drop(cache);

        if !fresh.is_empty() {
            info!(?fresh, "subscribing symbols");
            let _ = self.request_tx.send(FeedRequest::Subscribe { symbols: fresh });
        }
    }

    async fn unsubscribe(&self, symbols: &[Symbol]) {
        if symbols.is_empty() {
            return;
        }
        let mut cache = self.cache.lock().await;
        let removed: Vec<Symbol> = symbols
            .iter()
            .filter(|symbol| cache.subscribed.remove(*symbol))
            .cloned()
            .collect();
        for symbol in &removed {
            cache.ticks.remove(symbol);
        }
        drop(cache);

        if !removed.is_empty() {
            info!(?removed, "unsubscribing symbols");
            let _ = self
                .request_tx
                .send(FeedRequest::Unsubscribe { symbols: removed });
        }
    }

    async fn latest_tick(&self, symbol: &Symbol) -> Option<Tick> {
        self.cache.lock().await.ticks.get(symbol).cloned()
    }

    async fn candles(&self, symbol: &Symbol, timeframe: Timeframe) -> Option<Vec<Candle>> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.config.rest_url,
            symbol,
            timeframe.label(),
            self.config.backfill_limit,
        );

        let response = match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(%symbol, status = %response.status(), "backfill request rejected");
                return None;
            }
            Err(error) => {
                warn!(%symbol, %error, "backfill request failed");
                return None;
            }
        };

        match response.json::<Vec<KlineRow>>().await {
            Ok(rows) => Some(parse_klines(rows)),
            Err(error) => {
                warn!(%symbol, %error, "backfill parse failed");
                None
            }
        }
    }

    fn connection_state(&self) -> ConnectionState {
        *self.status_rx.borrow()
    }
}

/// Connection loop with auto-reconnect; re-announces the subscription set
/// after every reconnect so the server resumes the same tick stream
async fn run_feed_loop(
    config: LiveFeedConfig,
    cache: Arc<Mutex<FeedCache>>,
    status_tx: watch::Sender<ConnectionState>,
    mut request_rx: mpsc::UnboundedReceiver<FeedRequest>,
) {
    info!(url = %config.ws_url, "starting live feed");

    loop {
        let _ = status_tx.send(ConnectionState::Reconnecting);

        match connect_async(config.ws_url.as_str()).await {
            Ok((ws_stream, _)) => {
                info!(url = %config.ws_url, "feed connected");
                let _ = status_tx.send(ConnectionState::Connected);

                let (mut write, mut read) = ws_stream.split();

                // Resume the current subscription set on (re)connect
                let subscribed: Vec<Symbol> =
                    cache.lock().await.subscribed.iter().cloned().collect();
                if !subscribed.is_empty() {
                    if let Ok(frame) =
                        serde_json::to_string(&FeedRequest::Subscribe { symbols: subscribed })
                    {
                        let _ = write.send(Message::Text(frame.into())).await;
                    }
                }

                let mut ping = tokio::time::interval(config.ping_interval);
                ping.tick().await;

                loop {
                    tokio::select! {
                        message = read.next() => match message {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<FeedMessage>(&text) {
                                    Ok(FeedMessage::Tick { symbol, price, time }) => {
                                        let mut cache = cache.lock().await;
                                        let symbol = Symbol::new(&symbol);
                                        if cache.subscribed.contains(&symbol) {
                                            cache.ticks.insert(
                                                symbol.clone(),
                                                Tick { symbol, price, time },
                                            );
                                        }
                                    }
                                    Ok(FeedMessage::Welcome { .. }) => {
                                        debug!("received welcome message");
                                    }
                                    Err(parse_error) => {
                                        debug!(%parse_error, "unparseable feed message");
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) => {
                                warn!("feed server closed connection");
                                break;
                            }
                            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                                // Heartbeat, handled by tungstenite
                            }
                            Some(Ok(_)) => {}
                            Some(Err(error)) => {
                                error!(%error, "feed stream error");
                                break;
                            }
                            None => break,
                        },
                        request = request_rx.recv() => match request {
                            Some(frame) => {
                                if let Ok(json) = serde_json::to_string(&frame) {
                                    if write.send(Message::Text(json.into())).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            // Adapter dropped: stop for good
                            None => return,
                        },
                        _ = ping.tick() => {
                            if write.send(Message::Ping(vec![].into())).await.is_err() {
                                debug!("ping failed, connection likely dead");
                                break;
                            }
                        }
                    }
                }

                let _ = status_tx.send(ConnectionState::Reconnecting);
            }
            Err(error) => {
                error!(url = %config.ws_url, %error, "feed connection failed");
            }
        }

        debug!(delay = ?config.reconnect_delay, "waiting before reconnect");
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_klines() {
        let raw = r#"[
            [1717243200000, "100.0", "105.0", "99.0", "104.0", "12.5", 1717243259999, "0", 10, "0", "0", "0"],
            [1717243260000, "104.0", "106.0", "103.0", "105.5", "8.0", 1717243319999, "0", 7, "0", "0", "0"]
        ]"#;

        let rows: Vec<KlineRow> = serde_json::from_str(raw).unwrap();
        let candles = parse_klines(rows);

        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open, 100.0);
        assert_eq!(candles[0].close, 104.0);
        assert_eq!(candles[0].volume, 12.5);
        assert!(candles[0].open_time < candles[1].open_time);
    }

    #[test]
    fn test_parse_klines_skips_malformed_rows() {
        let raw = r#"[
            [1717243200000, "not-a-number", "105.0", "99.0", "104.0", "12.5"],
            [1717243260000, "104.0", "106.0", "103.0", "105.5", "8.0"]
        ]"#;

        let rows: Vec<KlineRow> = serde_json::from_str(raw).unwrap();
        let candles = parse_klines(rows);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, 105.5);
    }

    #[test]
    fn test_feed_message_parsing() {
        let tick: FeedMessage = serde_json::from_str(
            r#"{"type":"tick","symbol":"BTCUSDT","price":50000.5,"time":"2025-06-01T12:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(
            tick,
            FeedMessage::Tick { price, .. } if price == 50000.5
        ));

        let welcome: FeedMessage =
            serde_json::from_str(r#"{"type":"welcome","message":"hi"}"#).unwrap();
        assert!(matches!(welcome, FeedMessage::Welcome { .. }));
    }

    #[test]
    fn test_subscribe_frame_shape() {
        let frame = FeedRequest::Subscribe {
            symbols: vec![Symbol::new("BTCUSDT")],
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"op":"subscribe","symbols":["BTCUSDT"]}"#);
    }

    #[test]
    fn test_config_builder() {
        let config = LiveFeedConfig::new("ws://localhost:9100", "http://localhost:9101")
            .with_reconnect_delay(Duration::from_secs(5))
            .with_backfill_limit(120);

        assert_eq!(config.ws_url, "ws://localhost:9100");
        assert_eq!(config.rest_url, "http://localhost:9101");
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.backfill_limit, 120);
    }
}
