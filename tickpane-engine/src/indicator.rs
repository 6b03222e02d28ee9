//! Indicator computation capability and the built-in catalog.
//!
//! An executor is stateless per call: it receives the full candle window
//! and the per-overlay parameters, and returns either one value per input
//! bar (possibly with leading nulls while the window warms up) or a single
//! scalar reading. Failures are per-call and never carry state across
//! calls.

use async_trait::async_trait;
use tickpane_core::{Candle, EngineError, IndicatorParams, IndicatorRef, OverlayId, PaneId};

/// Result of one indicator computation
#[derive(Debug, Clone, PartialEq)]
pub enum IndicatorOutput {
    /// One value per input bar; `None` marks warm-up gaps
    Series(Vec<Option<f64>>),
    /// A single current reading, rendered as a constant reference line
    Scalar(f64),
}

/// Indicator computation capability consumed by the overlay engine
#[async_trait]
pub trait IndicatorExecutor: Send + Sync {
    async fn execute(
        &self,
        indicator: &IndicatorRef,
        bars: &[Candle],
        parameters: &IndicatorParams,
    ) -> Result<IndicatorOutput, EngineError>;
}

/// Built-in indicator catalog
///
/// Read-only shared state populated once at startup. The catalog mirrors
/// the indicator library of the upstream terminal: simple moving average,
/// exponential moving average, RSI and the Bollinger middle band.
#[derive(Debug, Clone, Default)]
pub struct BuiltinCatalog;

impl BuiltinCatalog {
    pub fn new() -> Self {
        Self
    }

    /// Indicator references available from this catalog
    pub fn list(&self) -> Vec<IndicatorRef> {
        ["sma", "ema", "rsi", "bollinger"]
            .into_iter()
            .map(IndicatorRef::from)
            .collect()
    }

    /// Default display name for a catalog entry with its period parameter
    pub fn display_name(indicator: &IndicatorRef, parameters: &IndicatorParams) -> String {
        let period = period_param(parameters, default_period(indicator));
        format!("{}({})", indicator.as_str().to_uppercase(), period)
    }
}

fn default_period(indicator: &IndicatorRef) -> usize {
    match indicator.as_str() {
        "rsi" => 14,
        "bollinger" => 20,
        _ => 20,
    }
}

fn period_param(parameters: &IndicatorParams, default: usize) -> usize {
    parameters
        .get("period")
        .copied()
        .filter(|p| *p >= 1.0)
        .map(|p| p as usize)
        .unwrap_or(default)
}

#[async_trait]
impl IndicatorExecutor for BuiltinCatalog {
    async fn execute(
        &self,
        indicator: &IndicatorRef,
        bars: &[Candle],
        parameters: &IndicatorParams,
    ) -> Result<IndicatorOutput, EngineError> {
        let closes: Vec<f64> = bars.iter().map(|bar| bar.close).collect();
        let period = period_param(parameters, default_period(indicator));

        match indicator.as_str() {
            "sma" => Ok(IndicatorOutput::Series(sma(&closes, period))),
            "ema" => Ok(IndicatorOutput::Series(ema(&closes, period))),
            "rsi" => Ok(IndicatorOutput::Series(rsi(&closes, period))),
            "bollinger" => Ok(IndicatorOutput::Series(sma(&closes, period))),
            other => Err(EngineError::UnknownIndicator(other.to_string())),
        }
    }
}

/// Simple moving average: rolling mean, None until the window is full
fn sma(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(closes.len());
    let mut window_sum = 0.0;

    for (index, close) in closes.iter().enumerate() {
        window_sum += close;
        if index >= period {
            window_sum -= closes[index - period];
        }
        if index + 1 >= period {
            out.push(Some(window_sum / period as f64));
        } else {
            out.push(None);
        }
    }

    out
}

/// Exponential moving average, seeded with the first close
fn ema(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(closes.len());
    let mut current: Option<f64> = None;

    for close in closes {
        current = Some(match current {
            None => *close,
            Some(previous) => alpha * close + (1.0 - alpha) * previous,
        });
        out.push(current);
    }

    out
}

/// RSI over rolling mean gains/losses, None until the window is full
fn rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len().min(period)];
    if closes.len() <= period {
        return out;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|pair| pair[1] - pair[0]).collect();

    for end in period..deltas.len() + 1 {
        let window = &deltas[end - period..end];
        let gain: f64 = window.iter().filter(|d| **d > 0.0).sum::<f64>() / period as f64;
        let loss: f64 = -window.iter().filter(|d| **d < 0.0).sum::<f64>() / period as f64;

        let value = if loss == 0.0 {
            100.0
        } else {
            100.0 - 100.0 / (1.0 + gain / loss)
        };
        out.push(Some(value));
    }

    out
}

/// Recoverable per-overlay failure with the overlay named, for notification
pub fn overlay_failure(pane: PaneId, overlay: OverlayId, error: EngineError) -> EngineError {
    match error {
        scoped @ (EngineError::Indicator { .. } | EngineError::IndicatorTimeout { .. }) => scoped,
        other => EngineError::Indicator {
            pane,
            overlay,
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bars(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(index, close)| Candle {
                open_time: Utc
                    .with_ymd_and_hms(2025, 6, 1, 12, 0, 0)
                    .unwrap()
                    + chrono::Duration::minutes(index as i64),
                open: *close,
                high: *close,
                low: *close,
                close: *close,
                volume: 0.0,
            })
            .collect()
    }

    #[test]
    fn test_sma_warm_up_and_values() {
        let values = sma(&[1.0, 2.0, 3.0, 4.0], 2);
        assert_eq!(values, vec![None, Some(1.5), Some(2.5), Some(3.5)]);
    }

    #[test]
    fn test_ema_seeds_with_first_close() {
        let values = ema(&[10.0, 20.0], 3);
        assert_eq!(values[0], Some(10.0));
        // alpha = 0.5: 0.5 * 20 + 0.5 * 10
        assert_eq!(values[1], Some(15.0));
    }

    #[test]
    fn test_rsi_all_gains_is_100() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let values = rsi(&closes, 14);
        assert_eq!(values.len(), closes.len());
        assert!(values[..14].iter().all(Option::is_none));
        assert_eq!(values[14], Some(100.0));
    }

    #[test]
    fn test_rsi_window_too_small() {
        let values = rsi(&[1.0, 2.0, 3.0], 14);
        assert_eq!(values, vec![None, None, None]);
    }

    #[tokio::test]
    async fn test_catalog_executes_one_value_per_bar() {
        let catalog = BuiltinCatalog::new();
        let window = bars(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let mut params = IndicatorParams::new();
        params.insert("period".to_string(), 2.0);

        let output = catalog
            .execute(&IndicatorRef::from("sma"), &window, &params)
            .await
            .unwrap();

        match output {
            IndicatorOutput::Series(values) => assert_eq!(values.len(), window.len()),
            IndicatorOutput::Scalar(_) => panic!("expected per-bar series"),
        }
    }

    #[tokio::test]
    async fn test_catalog_rejects_unknown_indicator() {
        let catalog = BuiltinCatalog::new();
        let result = catalog
            .execute(&IndicatorRef::from("vortex"), &bars(&[1.0]), &IndicatorParams::new())
            .await;

        assert_eq!(
            result,
            Err(EngineError::UnknownIndicator("vortex".to_string()))
        );
    }
}
