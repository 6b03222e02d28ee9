/// Events and render snapshots flowing out of the engine
///
/// `TerminalEvent` is the user-facing notification channel (alert fires,
/// recoverable errors, connectivity changes). `RenderSnapshot` is the
/// read-only view the UI layer draws from; it is published on a watch
/// channel after every state change so the renderer never reaches into
/// engine internals.
use crate::feed::ConnectionState;
use chrono::{DateTime, Utc};
use tickpane_core::{
    Candle, EngineError, OverlayColor, OverlayId, PaneId, PriceAlert, Symbol, Timeframe,
};

/// User-visible notifications emitted by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalEvent {
    /// A price alert transitioned Armed -> Fired
    AlertFired { alert: PriceAlert, price: f64 },
    /// One overlay's computation failed; the rest of the batch completed
    OverlayError {
        pane: PaneId,
        overlay: OverlayId,
        display_name: String,
        error: EngineError,
    },
    /// Feed connectivity changed (degrade-gracefully indicator, not an error)
    ConnectivityChanged(ConnectionState),
    /// A backfill batch replaced tick-derived provisional data on a pane
    Backfilled { pane: PaneId, candles: usize },
    /// A template was appended to the persisted list
    TemplateSaved { name: String },
    /// A template was applied to the surface
    TemplateApplied { name: String },
    /// Template load/save failed; in-memory chart state is untouched
    TemplateError(EngineError),
}

/// Read-only view of one overlay for rendering
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayView {
    pub id: OverlayId,
    pub display_name: String,
    pub color: OverlayColor,
    pub visible: bool,
    /// (open_time, value) points keyed to the pane's candle time axis
    pub points: Vec<(DateTime<Utc>, f64)>,
}

/// Read-only view of one chart pane for rendering
#[derive(Debug, Clone, PartialEq)]
pub struct PaneView {
    pub id: PaneId,
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    /// Rendered series: authoritative tail plus the synthetic trailing
    /// point, bounded to the most recent 300 candles
    pub candles: Vec<Candle>,
    pub overlays: Vec<OverlayView>,
    /// True for 5 seconds after a backfill superseded provisional data
    pub recently_backfilled: bool,
}

/// Full surface snapshot published to the UI after each state change
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderSnapshot {
    pub panes: Vec<PaneView>,
    pub alerts: Vec<PriceAlert>,
    pub connectivity: ConnectionState,
}
