//! Tickpane Core - Data Model
//!
//! Shared data types for the tickpane charting terminal:
//! - Ticks, candles and timeframes flowing in from the market-data feed
//! - The [`CandleSeries`](series::CandleSeries) owned by each chart pane
//! - Price alerts and their arm/fire lifecycle
//! - Immutable chart templates for save/apply
//! - The recoverable error taxonomy shared by all engine components

pub mod alert;
pub mod error;
pub mod series;
pub mod template;
pub mod types;

// Re-export commonly used types for convenience
pub use alert::{AlertCondition, AlertId, PriceAlert};
pub use error::EngineError;
pub use series::CandleSeries;
pub use template::{ChartTemplate, TemplateOverlay};
pub use types::{
    Candle, IndicatorParams, IndicatorRef, OverlayColor, OverlayId, PaneId, Symbol, Tick,
    Timeframe,
};
