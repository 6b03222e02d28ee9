//! Tickpane Engine
//!
//! The real-time core of the charting terminal:
//! - [`ChartSurfaceManager`](surface::ChartSurfaceManager) owns the chart
//!   panes and their authoritative candle series
//! - [`IndicatorOverlayEngine`](overlay::IndicatorOverlayEngine) schedules
//!   indicator computation and maps results onto the pane's time axis
//! - [`AlertMonitor`](alert::AlertMonitor) samples live prices and fires
//!   at-most-once price alerts
//! - [`ConfigurationSnapshot`](template::ConfigurationSnapshot) saves and
//!   applies named chart templates
//!
//! All four run on one logical task inside [`Terminal`](engine::Terminal),
//! which processes commands, scheduler ticks and overlay completions one at
//! a time. The only suspending operation is the indicator-computation call,
//! which is why recomputes are guarded to at most one in flight per pane.

pub mod alert;
pub mod engine;
pub mod event;
pub mod feed;
pub mod indicator;
pub mod live;
pub mod overlay;
pub mod scheduler;
pub mod surface;
pub mod template;

// Re-export commonly used types for convenience
pub use alert::{AlertMonitor, FiredAlert};
pub use engine::{Terminal, TerminalCommand, TerminalConfig, TerminalHandles};
pub use event::{OverlayView, PaneView, RenderSnapshot, TerminalEvent};
pub use feed::{ConnectionState, MarketFeed};
pub use indicator::{BuiltinCatalog, IndicatorExecutor, IndicatorOutput};
pub use live::{LiveFeed, LiveFeedConfig};
pub use overlay::IndicatorOverlayEngine;
pub use scheduler::Scheduler;
pub use surface::ChartSurfaceManager;
pub use template::{ConfigurationSnapshot, JsonFileStore, TemplateStore};
