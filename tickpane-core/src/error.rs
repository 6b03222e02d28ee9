use crate::types::{OverlayId, PaneId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated by the charting engine.
///
/// None of these are fatal: the terminal degrades to stale data or partial
/// overlays instead of halting. Variants map onto the user-visible
/// notifications the engine emits.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Error)]
pub enum EngineError {
    #[error("market feed unavailable: {0}")]
    Feed(String),

    #[error("indicator computation failed for {overlay} on {pane}: {reason}")]
    Indicator {
        pane: PaneId,
        overlay: OverlayId,
        reason: String,
    },

    #[error("indicator computation timed out for {overlay} on {pane}")]
    IndicatorTimeout { pane: PaneId, overlay: OverlayId },

    #[error("unknown indicator: {0}")]
    UnknownIndicator(String),

    #[error("template store failure: {0}")]
    Template(String),
}

impl EngineError {
    /// Whether the error only affects a single overlay, leaving the rest
    /// of the recompute batch intact.
    pub fn is_overlay_scoped(&self) -> bool {
        matches!(
            self,
            EngineError::Indicator { .. }
                | EngineError::IndicatorTimeout { .. }
                | EngineError::UnknownIndicator(_)
        )
    }
}
