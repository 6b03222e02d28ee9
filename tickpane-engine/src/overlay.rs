//! Indicator overlay engine.
//!
//! Schedules indicator computation for the overlays attached to each pane
//! and maps results back onto the pane's candle time axis. Overlays are
//! keyed `(pane, overlay)` so every pane owns its own overlay set.
//!
//! Concurrency guard: at most one recompute batch is in flight per pane.
//! A recompute request arriving while a previous one is outstanding is
//! dropped, not queued - the candle window will already include the missed
//! update on the next natural trigger. Completions are tagged with the
//! pane generation they were started against; anything stale by the time
//! it completes is discarded instead of applied.
//!
//! Rendering resources are an explicit arena of render handles indexed by
//! overlay id, released on `remove_overlay` and pane teardown.

use crate::event::OverlayView;
use crate::indicator::{overlay_failure, BuiltinCatalog, IndicatorExecutor, IndicatorOutput};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tickpane_core::{
    Candle, EngineError, IndicatorParams, IndicatorRef, OverlayColor, OverlayId, PaneId,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A user-added indicator overlay attached to one pane
#[derive(Debug, Clone)]
pub struct OverlayState {
    pub id: OverlayId,
    pub indicator: IndicatorRef,
    pub display_name: String,
    pub color: OverlayColor,
    pub visible: bool,
    pub parameters: IndicatorParams,
    /// Most recent computed series, absent until the first recompute lands
    pub last_computed: Option<Vec<(DateTime<Utc>, f64)>>,
}

/// Rendering resource paired with one overlay
#[derive(Debug, Clone, Default)]
pub struct RenderHandle {
    pub points: Vec<(DateTime<Utc>, f64)>,
}

/// Message sent back from a recompute task
#[derive(Debug)]
pub enum RecomputeOutcome {
    OverlayResult {
        pane: PaneId,
        generation: u64,
        overlay: OverlayId,
        result: Result<Vec<(DateTime<Utc>, f64)>, EngineError>,
    },
    BatchComplete {
        pane: PaneId,
        generation: u64,
    },
}

/// What applying one outcome amounted to
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedOutcome {
    /// Overlay series written into the arena
    Updated { pane: PaneId, overlay: OverlayId },
    /// Per-overlay recoverable failure, to be surfaced as a notification
    Failed {
        pane: PaneId,
        overlay: OverlayId,
        display_name: String,
        error: EngineError,
    },
    /// Result arrived after the pane/overlay was torn down or rebound
    Discarded,
    /// A recompute batch finished; the pane accepts new requests again
    BatchComplete { pane: PaneId },
}

struct InFlight {
    generation: u64,
    task: JoinHandle<()>,
}

/// Schedules overlay computation and owns the render-handle arena
pub struct IndicatorOverlayEngine {
    executor: Arc<dyn IndicatorExecutor>,
    overlays: HashMap<PaneId, IndexMap<OverlayId, OverlayState>>,
    arena: IndexMap<OverlayId, RenderHandle>,
    in_flight: HashMap<PaneId, InFlight>,
    outcome_tx: mpsc::UnboundedSender<RecomputeOutcome>,
    next_overlay_id: u64,
    compute_timeout: Duration,
}

impl IndicatorOverlayEngine {
    /// Create the engine and the receiver its recompute tasks report to
    pub fn new(
        executor: Arc<dyn IndicatorExecutor>,
        compute_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<RecomputeOutcome>) {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let engine = Self {
            executor,
            overlays: HashMap::new(),
            arena: IndexMap::new(),
            in_flight: HashMap::new(),
            outcome_tx,
            next_overlay_id: 0,
            compute_timeout,
        };
        (engine, outcome_rx)
    }

    /// Attach an overlay to a pane and allocate its render handle
    pub fn add_overlay(
        &mut self,
        pane: PaneId,
        indicator: IndicatorRef,
        parameters: IndicatorParams,
    ) -> OverlayId {
        self.next_overlay_id += 1;
        let id = OverlayId(self.next_overlay_id);

        let pane_overlays = self.overlays.entry(pane).or_default();
        let state = OverlayState {
            id,
            display_name: BuiltinCatalog::display_name(&indicator, &parameters),
            color: OverlayColor::for_index(pane_overlays.len()),
            visible: true,
            indicator,
            parameters,
            last_computed: None,
        };
        debug!(pane = %pane, overlay = %id, name = %state.display_name, "overlay added");
        pane_overlays.insert(id, state);
        self.arena.insert(id, RenderHandle::default());
        id
    }

    /// Detach an overlay and release its render handle
    pub fn remove_overlay(&mut self, pane: PaneId, overlay: OverlayId) -> bool {
        let removed = self
            .overlays
            .get_mut(&pane)
            .and_then(|pane_overlays| pane_overlays.shift_remove(&overlay))
            .is_some();
        if removed {
            self.arena.shift_remove(&overlay);
            debug!(pane = %pane, overlay = %overlay, "overlay removed, render handle released");
        }
        removed
    }

    /// Flip an overlay's visibility; hidden overlays are skipped on
    /// recompute and keep their last series untouched
    pub fn toggle_visible(&mut self, pane: PaneId, overlay: OverlayId) -> Option<bool> {
        let state = self.overlays.get_mut(&pane)?.get_mut(&overlay)?;
        state.visible = !state.visible;
        Some(state.visible)
    }

    /// Replace an overlay's parameters; the computed series is cleared
    /// until the next recompute runs with the new parameters
    pub fn set_parameters(
        &mut self,
        pane: PaneId,
        overlay: OverlayId,
        parameters: IndicatorParams,
    ) -> bool {
        let Some(state) = self
            .overlays
            .get_mut(&pane)
            .and_then(|pane_overlays| pane_overlays.get_mut(&overlay))
        else {
            return false;
        };
        state.display_name = BuiltinCatalog::display_name(&state.indicator, &parameters);
        state.parameters = parameters;
        state.last_computed = None;
        if let Some(handle) = self.arena.get_mut(&overlay) {
            handle.points.clear();
        }
        true
    }

    /// Overlays attached to a pane, in insertion order
    pub fn pane_overlays(&self, pane: PaneId) -> impl Iterator<Item = &OverlayState> {
        self.overlays.get(&pane).into_iter().flat_map(|o| o.values())
    }

    /// The most recently added overlay on a pane, if any
    pub fn last_overlay(&self, pane: PaneId) -> Option<OverlayId> {
        self.overlays
            .get(&pane)
            .and_then(|pane_overlays| pane_overlays.keys().last().copied())
    }

    /// Tear a pane down: abort any in-flight batch and release every
    /// overlay and render handle attached to it
    pub fn release_pane(&mut self, pane: PaneId) {
        self.cancel_pane(pane);
        if let Some(pane_overlays) = self.overlays.remove(&pane) {
            for overlay in pane_overlays.keys() {
                self.arena.shift_remove(overlay);
            }
        }
    }

    /// Abort the in-flight batch for a pane (symbol/timeframe rebind) and
    /// clear computed series; the overlay set itself survives the rebind
    pub fn cancel_pane(&mut self, pane: PaneId) {
        if let Some(in_flight) = self.in_flight.remove(&pane) {
            in_flight.task.abort();
            debug!(pane = %pane, "in-flight recompute cancelled");
        }
        if let Some(pane_overlays) = self.overlays.get_mut(&pane) {
            for state in pane_overlays.values_mut() {
                state.last_computed = None;
                if let Some(handle) = self.arena.get_mut(&state.id) {
                    handle.points.clear();
                }
            }
        }
    }

    /// Kick off recomputation of every visible overlay on a pane.
    ///
    /// Returns false when the request was dropped because a batch for this
    /// pane is still outstanding.
    pub fn recompute(&mut self, pane: PaneId, generation: u64, candles: &[Candle]) -> bool {
        if self.in_flight.contains_key(&pane) {
            debug!(pane = %pane, "recompute dropped, previous batch still in flight");
            return false;
        }

        let jobs: Vec<(OverlayId, IndicatorRef, IndicatorParams)> = self
            .pane_overlays(pane)
            .filter(|state| state.visible)
            .map(|state| (state.id, state.indicator.clone(), state.parameters.clone()))
            .collect();
        if jobs.is_empty() {
            return true;
        }

        let executor = Arc::clone(&self.executor);
        let outcome_tx = self.outcome_tx.clone();
        let window: Arc<[Candle]> = Arc::from(candles.to_vec());
        let compute_timeout = self.compute_timeout;

        let task = tokio::spawn(async move {
            for (overlay, indicator, parameters) in jobs {
                let result = match tokio::time::timeout(
                    compute_timeout,
                    executor.execute(&indicator, &window, &parameters),
                )
                .await
                {
                    Err(_) => Err(EngineError::IndicatorTimeout { pane, overlay }),
                    Ok(Err(error)) => Err(overlay_failure(pane, overlay, error)),
                    Ok(Ok(output)) => Ok(map_output(&window, output)),
                };

                // One failing overlay must not stop the remaining ones
                let _ = outcome_tx.send(RecomputeOutcome::OverlayResult {
                    pane,
                    generation,
                    overlay,
                    result,
                });
            }
            let _ = outcome_tx.send(RecomputeOutcome::BatchComplete { pane, generation });
        });

        self.in_flight.insert(pane, InFlight { generation, task });
        true
    }

    /// Apply a completed outcome, discarding anything stale.
    ///
    /// `current_generation` is the pane's generation right now (None if
    /// the pane no longer exists).
    pub fn apply_outcome(
        &mut self,
        outcome: RecomputeOutcome,
        current_generation: Option<u64>,
    ) -> AppliedOutcome {
        match outcome {
            RecomputeOutcome::BatchComplete { pane, generation } => {
                if self
                    .in_flight
                    .get(&pane)
                    .map(|in_flight| in_flight.generation == generation)
                    .unwrap_or(false)
                {
                    self.in_flight.remove(&pane);
                }
                AppliedOutcome::BatchComplete { pane }
            }
            RecomputeOutcome::OverlayResult {
                pane,
                generation,
                overlay,
                result,
            } => {
                if current_generation != Some(generation) {
                    debug!(pane = %pane, overlay = %overlay, "stale recompute result discarded");
                    return AppliedOutcome::Discarded;
                }
                let Some(state) = self
                    .overlays
                    .get_mut(&pane)
                    .and_then(|pane_overlays| pane_overlays.get_mut(&overlay))
                else {
                    debug!(pane = %pane, overlay = %overlay, "result for removed overlay discarded");
                    return AppliedOutcome::Discarded;
                };

                match result {
                    Ok(points) => {
                        state.last_computed = Some(points.clone());
                        if let Some(handle) = self.arena.get_mut(&overlay) {
                            handle.points = points;
                        }
                        AppliedOutcome::Updated { pane, overlay }
                    }
                    Err(error) => {
                        warn!(
                            pane = %pane,
                            overlay = %state.display_name,
                            %error,
                            "overlay computation failed"
                        );
                        AppliedOutcome::Failed {
                            pane,
                            overlay,
                            display_name: state.display_name.clone(),
                            error,
                        }
                    }
                }
            }
        }
    }

    /// Render handle for an overlay, if still allocated
    pub fn render_handle(&self, overlay: OverlayId) -> Option<&RenderHandle> {
        self.arena.get(&overlay)
    }

    /// Read-only overlay views for rendering one pane
    pub fn views(&self, pane: PaneId) -> Vec<OverlayView> {
        self.pane_overlays(pane)
            .map(|state| OverlayView {
                id: state.id,
                display_name: state.display_name.clone(),
                color: state.color,
                visible: state.visible,
                points: self
                    .arena
                    .get(&state.id)
                    .map(|handle| handle.points.clone())
                    .unwrap_or_default(),
            })
            .collect()
    }
}

/// Map an indicator output onto the candle time axis.
///
/// One value per input bar zips 1:1 to bar open times, skipping nulls.
/// Anything shorter (a scalar, or a capability that only returned the
/// current reading) broadcasts the latest value across the full visible
/// range as a constant reference line.
fn map_output(candles: &[Candle], output: IndicatorOutput) -> Vec<(DateTime<Utc>, f64)> {
    match output {
        IndicatorOutput::Scalar(value) => broadcast(candles, value),
        IndicatorOutput::Series(values) if values.len() == candles.len() => candles
            .iter()
            .zip(values)
            .filter_map(|(candle, value)| value.map(|v| (candle.open_time, v)))
            .collect(),
        IndicatorOutput::Series(values) => values
            .iter()
            .rev()
            .find_map(|value| *value)
            .map(|latest| broadcast(candles, latest))
            .unwrap_or_default(),
    }
}

fn broadcast(candles: &[Candle], value: f64) -> Vec<(DateTime<Utc>, f64)> {
    candles
        .iter()
        .map(|candle| (candle.open_time, value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn window(len: u32) -> Vec<Candle> {
        (0..len)
            .map(|minute| Candle {
                open_time: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
                    + chrono::Duration::minutes(minute as i64),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0 + minute as f64,
                volume: 1.0,
            })
            .collect()
    }

    /// Stub executor: "slow" sleeps, "bad" fails, everything else echoes
    /// one value per bar. Counts dispatched executions.
    struct StubExecutor {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl StubExecutor {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
            })
        }
    }

    #[async_trait]
    impl IndicatorExecutor for StubExecutor {
        async fn execute(
            &self,
            indicator: &IndicatorRef,
            bars: &[Candle],
            _parameters: &IndicatorParams,
        ) -> Result<IndicatorOutput, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match indicator.as_str() {
                "bad" => Err(EngineError::UnknownIndicator("bad".to_string())),
                "scalar" => Ok(IndicatorOutput::Scalar(42.0)),
                _ => Ok(IndicatorOutput::Series(
                    bars.iter().map(|bar| Some(bar.close)).collect(),
                )),
            }
        }
    }

    fn engine_with(
        executor: Arc<StubExecutor>,
    ) -> (IndicatorOverlayEngine, mpsc::UnboundedReceiver<RecomputeOutcome>) {
        IndicatorOverlayEngine::new(executor, Duration::from_secs(5))
    }

    async fn drain_batch(
        engine: &mut IndicatorOverlayEngine,
        rx: &mut mpsc::UnboundedReceiver<RecomputeOutcome>,
        current_generation: Option<u64>,
    ) -> Vec<AppliedOutcome> {
        let mut applied = Vec::new();
        loop {
            let outcome = rx.recv().await.expect("recompute task dropped channel");
            let is_complete = matches!(outcome, RecomputeOutcome::BatchComplete { .. });
            applied.push(engine.apply_outcome(outcome, current_generation));
            if is_complete {
                return applied;
            }
        }
    }

    #[test]
    fn test_map_output_zips_equal_length_skipping_nulls() {
        let candles = window(3);
        let mapped = map_output(
            &candles,
            IndicatorOutput::Series(vec![None, Some(1.0), Some(2.0)]),
        );
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped[0], (candles[1].open_time, 1.0));
        assert_eq!(mapped[1], (candles[2].open_time, 2.0));
    }

    #[test]
    fn test_map_output_broadcasts_scalar() {
        let candles = window(4);
        let mapped = map_output(&candles, IndicatorOutput::Scalar(55.5));
        assert_eq!(mapped.len(), 4);
        assert!(mapped.iter().all(|(_, value)| *value == 55.5));
    }

    #[test]
    fn test_map_output_broadcasts_short_series_latest_value() {
        let candles = window(4);
        let mapped = map_output(
            &candles,
            IndicatorOutput::Series(vec![Some(1.0), Some(7.0)]),
        );
        assert_eq!(mapped.len(), 4);
        assert!(mapped.iter().all(|(_, value)| *value == 7.0));
    }

    #[tokio::test]
    async fn test_overlay_isolation_on_failure() {
        let executor = StubExecutor::new(Duration::ZERO);
        let (mut engine, mut rx) = engine_with(Arc::clone(&executor));
        let pane = PaneId(0);

        let bad = engine.add_overlay(pane, IndicatorRef::from("bad"), IndicatorParams::new());
        let good = engine.add_overlay(pane, IndicatorRef::from("echo"), IndicatorParams::new());

        assert!(engine.recompute(pane, 1, &window(10)));
        let applied = drain_batch(&mut engine, &mut rx, Some(1)).await;

        assert!(applied.iter().any(|outcome| matches!(
            outcome,
            AppliedOutcome::Failed { overlay, .. } if *overlay == bad
        )));
        assert!(applied.iter().any(|outcome| matches!(
            outcome,
            AppliedOutcome::Updated { overlay, .. } if *overlay == good
        )));
        // The healthy overlay produced a full series on the same cycle
        assert_eq!(engine.render_handle(good).unwrap().points.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_recompute_in_flight() {
        let executor = StubExecutor::new(Duration::from_millis(200));
        let (mut engine, mut rx) = engine_with(Arc::clone(&executor));
        let pane = PaneId(0);
        engine.add_overlay(pane, IndicatorRef::from("echo"), IndicatorParams::new());

        assert!(engine.recompute(pane, 1, &window(5)));
        // Second trigger within the same cycle: dropped, no extra dispatch
        assert!(!engine.recompute(pane, 1, &window(5)));

        let applied = drain_batch(&mut engine, &mut rx, Some(1)).await;
        assert!(applied.contains(&AppliedOutcome::BatchComplete { pane }));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        // Batch finished: the pane accepts requests again
        assert!(engine.recompute(pane, 1, &window(5)));
    }

    #[tokio::test]
    async fn test_stale_result_discarded_after_teardown() {
        let executor = StubExecutor::new(Duration::ZERO);
        let (mut engine, mut rx) = engine_with(executor);
        let pane = PaneId(0);
        engine.add_overlay(pane, IndicatorRef::from("echo"), IndicatorParams::new());

        assert!(engine.recompute(pane, 1, &window(5)));

        // Pane torn down while the computation is in flight; results may
        // still arrive if the task already finished its sends
        let mut applied = Vec::new();
        while let Some(outcome) = rx.recv().await {
            let is_complete = matches!(outcome, RecomputeOutcome::BatchComplete { .. });
            applied.push(engine.apply_outcome(outcome, None));
            if is_complete {
                break;
            }
        }

        assert!(applied.iter().all(|outcome| !matches!(
            outcome,
            AppliedOutcome::Updated { .. } | AppliedOutcome::Failed { .. }
        )));
    }

    #[tokio::test]
    async fn test_result_for_removed_overlay_discarded() {
        let executor = StubExecutor::new(Duration::ZERO);
        let (mut engine, mut rx) = engine_with(executor);
        let pane = PaneId(0);
        let overlay = engine.add_overlay(pane, IndicatorRef::from("echo"), IndicatorParams::new());

        assert!(engine.recompute(pane, 1, &window(5)));
        engine.remove_overlay(pane, overlay);

        let applied = drain_batch(&mut engine, &mut rx, Some(1)).await;
        assert!(applied.contains(&AppliedOutcome::Discarded));
        assert!(engine.render_handle(overlay).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_computation_timeout_is_per_overlay_failure() {
        let executor = StubExecutor::new(Duration::from_secs(30));
        let (mut engine, mut rx) =
            IndicatorOverlayEngine::new(executor, Duration::from_secs(5));
        let pane = PaneId(0);
        let overlay =
            engine.add_overlay(pane, IndicatorRef::from("echo"), IndicatorParams::new());

        assert!(engine.recompute(pane, 1, &window(5)));
        let applied = drain_batch(&mut engine, &mut rx, Some(1)).await;

        assert!(applied.iter().any(|outcome| matches!(
            outcome,
            AppliedOutcome::Failed { error: EngineError::IndicatorTimeout { .. }, overlay: o, .. }
                if *o == overlay
        )));
    }

    #[test]
    fn test_set_parameters_renames_and_clears_series() {
        let executor = StubExecutor::new(Duration::ZERO);
        let (mut engine, _rx) = engine_with(executor);
        let pane = PaneId(0);
        let overlay = engine.add_overlay(pane, IndicatorRef::from("sma"), IndicatorParams::new());
        assert_eq!(
            engine.pane_overlays(pane).next().unwrap().display_name,
            "SMA(20)"
        );

        let mut parameters = IndicatorParams::new();
        parameters.insert("period".to_string(), 50.0);
        assert!(engine.set_parameters(pane, overlay, parameters));

        let state = engine.pane_overlays(pane).next().unwrap();
        assert_eq!(state.display_name, "SMA(50)");
        assert!(state.last_computed.is_none());
        assert!(!engine.set_parameters(PaneId(9), overlay, IndicatorParams::new()));
    }

    #[tokio::test]
    async fn test_hidden_overlay_not_dispatched() {
        let executor = StubExecutor::new(Duration::ZERO);
        let (mut engine, mut rx) = engine_with(Arc::clone(&executor));
        let pane = PaneId(0);
        let overlay = engine.add_overlay(pane, IndicatorRef::from("echo"), IndicatorParams::new());
        engine.toggle_visible(pane, overlay);

        // Only hidden overlays attached: nothing to dispatch, not in flight
        assert!(engine.recompute(pane, 1, &window(5)));
        assert!(engine.recompute(pane, 1, &window(5)));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        drop(rx);
    }
}
