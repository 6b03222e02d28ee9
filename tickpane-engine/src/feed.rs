/// Market-data feed capability
///
/// The engine treats the feed as eventually consistent and push-driven on
/// the far side: it polls `latest_tick`/`candles` on its own timers rather
/// than assuming push callbacks, and tolerates silent staleness. A feed
/// that returns `None` is not an error.
use async_trait::async_trait;
use tickpane_core::{Candle, Symbol, Tick, Timeframe};

/// Connection status of the upstream feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    Connected,
    #[default]
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "LIVE",
            ConnectionState::Reconnecting => "RECONNECTING",
        }
    }
}

/// Streaming market-data source consumed by the chart surface
#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Start delivering ticks for the given symbols. Subscribing to an
    /// already-subscribed symbol is a no-op.
    async fn subscribe(&self, symbols: &[Symbol]);

    /// Stop delivering ticks for the given symbols.
    async fn unsubscribe(&self, symbols: &[Symbol]);

    /// Latest observed tick for a symbol, if any has arrived yet.
    async fn latest_tick(&self, symbol: &Symbol) -> Option<Tick>;

    /// Historical candle window for a symbol/timeframe, if available.
    async fn candles(&self, symbol: &Symbol, timeframe: Timeframe) -> Option<Vec<Candle>>;

    /// Current connection status, for the connectivity indicator only.
    fn connection_state(&self) -> ConnectionState;
}
