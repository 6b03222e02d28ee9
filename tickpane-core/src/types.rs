/// Core data types shared across the terminal
///
/// These types describe the market data flowing in from the feed and the
/// identifiers the engine components key their state by.
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::BTreeMap;

/// Instrument symbol, e.g. "BTCUSDT"
pub type Symbol = SmolStr;

/// Free-form numeric parameters passed to an indicator, e.g. `{"period": 14}`
pub type IndicatorParams = BTreeMap<String, f64>;

/// Identifier of a chart pane within the current layout (0 is primary)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    derive_more::Display, derive_more::From, derive_more::Constructor,
)]
#[display("pane-{_0}")]
pub struct PaneId(pub usize);

/// Identifier of an indicator overlay, unique across the engine lifetime
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    derive_more::Display, derive_more::From, derive_more::Constructor,
)]
#[display("overlay-{_0}")]
pub struct OverlayId(pub u64);

/// Reference to an indicator in the catalog, e.g. "rsi"
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    derive_more::Display,
)]
pub struct IndicatorRef(pub SmolStr);

impl IndicatorRef {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(SmolStr::new(name))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for IndicatorRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A single trade/quote observation from the feed
///
/// Transient: ticks are rendered and sampled, never persisted.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Tick {
    pub symbol: Symbol,
    pub price: f64,
    pub time: DateTime<Utc>,
}

impl Tick {
    pub fn new(symbol: impl AsRef<str>, price: f64, time: DateTime<Utc>) -> Self {
        Self {
            symbol: SmolStr::new(symbol),
            price,
            time,
        }
    }
}

/// OHLCV candle
///
/// Candles within a series are strictly ordered by `open_time` and unique
/// per `open_time`. Volume defaults to 0.0 for feeds that do not report it.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl Candle {
    /// Synthetic candle derived from a single tick, used for the rendered
    /// trailing point while no authoritative candle covers the tick yet
    pub fn from_tick(tick: &Tick) -> Self {
        Self {
            open_time: tick.time,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: 0.0,
        }
    }
}

/// Candle timeframe supported by the terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::M1 => Duration::minutes(1),
            Timeframe::M5 => Duration::minutes(5),
            Timeframe::M15 => Duration::minutes(15),
            Timeframe::H1 => Duration::hours(1),
            Timeframe::H4 => Duration::hours(4),
            Timeframe::D1 => Duration::days(1),
        }
    }

    /// Next timeframe in the cycle, wrapping around (used by the TUI)
    pub fn next(&self) -> Timeframe {
        let index = Self::ALL.iter().position(|tf| tf == self).unwrap_or(0);
        Self::ALL[(index + 1) % Self::ALL.len()]
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Display colour assigned to an overlay line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum OverlayColor {
    Yellow,
    Cyan,
    Magenta,
    Green,
    Blue,
    Red,
}

impl OverlayColor {
    pub const ALL: [OverlayColor; 6] = [
        OverlayColor::Yellow,
        OverlayColor::Cyan,
        OverlayColor::Magenta,
        OverlayColor::Green,
        OverlayColor::Blue,
        OverlayColor::Red,
    ];

    /// Colour for the n-th overlay added to a pane
    pub fn for_index(index: usize) -> Self {
        Self::ALL[index % Self::ALL.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_serde_round_trip() {
        for tf in Timeframe::ALL {
            let json = serde_json::to_string(&tf).unwrap();
            assert_eq!(json, format!("\"{}\"", tf.label()));
            let back: Timeframe = serde_json::from_str(&json).unwrap();
            assert_eq!(back, tf);
        }
    }

    #[test]
    fn test_timeframe_cycle_wraps() {
        assert_eq!(Timeframe::M1.next(), Timeframe::M5);
        assert_eq!(Timeframe::D1.next(), Timeframe::M1);
    }

    #[test]
    fn test_candle_from_tick() {
        let tick = Tick::new("BTCUSDT", 50_000.0, Utc::now());
        let candle = Candle::from_tick(&tick);
        assert_eq!(candle.open, 50_000.0);
        assert_eq!(candle.close, 50_000.0);
        assert_eq!(candle.open_time, tick.time);
        assert_eq!(candle.volume, 0.0);
    }

    #[test]
    fn test_overlay_color_cycles() {
        assert_eq!(OverlayColor::for_index(0), OverlayColor::Yellow);
        assert_eq!(OverlayColor::for_index(6), OverlayColor::Yellow);
        assert_eq!(OverlayColor::for_index(7), OverlayColor::Cyan);
    }
}
