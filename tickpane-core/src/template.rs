/// Named chart templates
///
/// A template captures the surface configuration at save time. Templates
/// are immutable once created: saving again appends a new template to the
/// persisted list rather than mutating an existing one.
use crate::types::{IndicatorParams, IndicatorRef, OverlayColor, Symbol, Timeframe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// One overlay entry within a template
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TemplateOverlay {
    pub indicator: IndicatorRef,
    pub parameters: IndicatorParams,
    pub color: OverlayColor,
}

/// A saved chart configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChartTemplate {
    pub name: String,
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    /// Pane count of the layout at save time (1, 2 or 4)
    pub layout: usize,
    /// Primary-pane overlays in display order
    pub overlays: Vec<TemplateOverlay>,
    pub created_at: DateTime<Utc>,
}

impl ChartTemplate {
    pub fn new(
        name: impl Into<String>,
        symbol: impl AsRef<str>,
        timeframe: Timeframe,
        layout: usize,
        overlays: Vec<TemplateOverlay>,
    ) -> Self {
        Self {
            name: name.into(),
            symbol: SmolStr::new(symbol),
            timeframe,
            layout,
            overlays,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IndicatorParams;

    #[test]
    fn test_template_json_round_trip() {
        let mut params = IndicatorParams::new();
        params.insert("period".to_string(), 14.0);

        let template = ChartTemplate::new(
            "scalp-btc",
            "BTCUSDT",
            Timeframe::M1,
            2,
            vec![TemplateOverlay {
                indicator: IndicatorRef::from("rsi"),
                parameters: params,
                color: OverlayColor::Cyan,
            }],
        );

        let json = serde_json::to_string(&template).unwrap();
        let back: ChartTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, template);
        assert_eq!(back.timeframe, Timeframe::M1);
        assert_eq!(back.overlays[0].parameters["period"], 14.0);
    }
}
