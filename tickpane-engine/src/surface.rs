//! Chart surface manager.
//!
//! Owns the N chart panes, binds each to a symbol/timeframe and ingests
//! candle batches and ticks from the feed. The authoritative candle series
//! of a pane is mutated here and nowhere else; the overlay engine and the
//! alert monitor only ever see snapshots.
//!
//! Every pane carries a generation counter. Rebinding or recreating a pane
//! bumps it, so results of in-flight overlay computations started against
//! the old binding can be recognised and discarded on completion.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use tickpane_core::{Candle, CandleSeries, PaneId, Symbol, Tick, Timeframe};
use tracing::{debug, info};

/// Upper bound on the rendered series length per pane
pub const RENDERED_POINT_BOUND: usize = 300;

/// Supported pane layouts; anything else clamps to a single pane
const VALID_LAYOUTS: [usize; 3] = [1, 2, 4];

/// How long the "recently backfilled" flag stays raised
const BACKFILL_FLAG_SECS: i64 = 5;

/// One independently rendered chart surface
#[derive(Debug, Clone)]
pub struct ChartPane {
    pub id: PaneId,
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub generation: u64,
    series: CandleSeries,
    /// Latest tick, rendered as a synthetic trailing point only
    last_tick: Option<Tick>,
    /// Length of the last applied backfill batch (coalescing heuristic)
    last_batch_len: Option<usize>,
    backfilled_at: Option<DateTime<Utc>>,
}

impl ChartPane {
    fn new(id: PaneId, symbol: Symbol, timeframe: Timeframe, generation: u64) -> Self {
        Self {
            id,
            symbol,
            timeframe,
            generation,
            series: CandleSeries::new(),
            last_tick: None,
            last_batch_len: None,
            backfilled_at: None,
        }
    }

    /// Authoritative candle series (read-only)
    pub fn series(&self) -> &CandleSeries {
        &self.series
    }

    /// Rendered series: the authoritative tail plus a synthetic trailing
    /// point for the latest tick, bounded to [`RENDERED_POINT_BOUND`].
    pub fn rendered(&self) -> Vec<Candle> {
        let candles = self.series.as_slice();
        let start = candles.len().saturating_sub(RENDERED_POINT_BOUND);
        let mut rendered: Vec<Candle> = candles[start..].to_vec();

        if let Some(tick) = &self.last_tick {
            let is_trailing = rendered
                .last()
                .map(|last| tick.time > last.open_time)
                .unwrap_or(true);
            if is_trailing {
                rendered.push(Candle::from_tick(tick));
                if rendered.len() > RENDERED_POINT_BOUND {
                    rendered.remove(0);
                }
            }
        }

        rendered
    }

    /// Transient reconciliation flag raised for 5 seconds after a backfill
    /// batch replaced tick-derived provisional data
    pub fn recently_backfilled(&self, now: DateTime<Utc>) -> bool {
        self.backfilled_at
            .map(|at| now - at < Duration::seconds(BACKFILL_FLAG_SECS))
            .unwrap_or(false)
    }

    fn rebind(&mut self, symbol: Symbol, timeframe: Timeframe, generation: u64) {
        self.symbol = symbol;
        self.timeframe = timeframe;
        self.generation = generation;
        self.series = CandleSeries::new();
        self.last_tick = None;
        self.last_batch_len = None;
        self.backfilled_at = None;
    }
}

/// Subscription delta produced by a layout or binding change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionDelta {
    pub subscribe: Vec<Symbol>,
    pub unsubscribe: Vec<Symbol>,
}

/// Pane teardown produced by a layout change: overlay work keyed to these
/// panes/generations must be cancelled
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutChange {
    pub torn_down: Vec<PaneId>,
    pub delta: SubscriptionDelta,
}

/// Outcome of applying one candle batch to a pane
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedBackfill {
    pub pane: PaneId,
    pub generation: u64,
    pub candle_count: usize,
    /// True when the batch superseded a tick-derived provisional point
    pub superseded_provisional: bool,
}

/// Owns all chart panes and their candle state
#[derive(Debug)]
pub struct ChartSurfaceManager {
    panes: Vec<ChartPane>,
    next_generation: u64,
}

impl ChartSurfaceManager {
    /// Create a single-pane surface bound to the given symbol/timeframe
    pub fn new(symbol: Symbol, timeframe: Timeframe) -> Self {
        let mut manager = Self {
            panes: Vec::new(),
            next_generation: 0,
        };
        let generation = manager.bump_generation();
        manager
            .panes
            .push(ChartPane::new(PaneId(0), symbol, timeframe, generation));
        manager
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub fn panes(&self) -> &[ChartPane] {
        &self.panes
    }

    pub fn pane(&self, id: PaneId) -> Option<&ChartPane> {
        self.panes.iter().find(|pane| pane.id == id)
    }

    fn pane_mut(&mut self, id: PaneId) -> Option<&mut ChartPane> {
        self.panes.iter_mut().find(|pane| pane.id == id)
    }

    /// Current generation of a pane, or None if it no longer exists
    pub fn pane_generation(&self, id: PaneId) -> Option<u64> {
        self.pane(id).map(|pane| pane.generation)
    }

    /// Symbols any pane is currently bound to
    pub fn active_symbols(&self) -> BTreeSet<Symbol> {
        self.panes.iter().map(|pane| pane.symbol.clone()).collect()
    }

    /// Destroy and recreate all panes for the requested layout.
    ///
    /// Pane 0's symbol/timeframe binding is preserved; new panes inherit
    /// it until rebound. Unsupported pane counts silently clamp to a
    /// single pane.
    pub fn set_layout(&mut self, pane_count: usize) -> LayoutChange {
        let pane_count = if VALID_LAYOUTS.contains(&pane_count) {
            pane_count
        } else {
            debug!(requested = pane_count, "unsupported pane layout, clamping to 1");
            1
        };

        let before = self.active_symbols();
        let torn_down: Vec<PaneId> = self.panes.iter().map(|pane| pane.id).collect();
        let (symbol, timeframe) = self
            .panes
            .first()
            .map(|primary| (primary.symbol.clone(), primary.timeframe))
            .unwrap_or_else(|| (Symbol::new("BTCUSDT"), Timeframe::M1));

        let base_generation = self.next_generation;
        self.panes = (0..pane_count)
            .map(|index| {
                let generation = base_generation + 1 + index as u64;
                ChartPane::new(PaneId(index), symbol.clone(), timeframe, generation)
            })
            .collect();
        self.next_generation += pane_count as u64;

        let after = self.active_symbols();
        info!(panes = pane_count, "layout changed");

        LayoutChange {
            torn_down,
            delta: SubscriptionDelta {
                subscribe: after.difference(&before).cloned().collect(),
                unsubscribe: before.difference(&after).cloned().collect(),
            },
        }
    }

    /// Rebind a pane to a new symbol. Returns the subscription delta, or
    /// None if the pane does not exist or is already bound to the symbol.
    pub fn set_symbol(&mut self, id: PaneId, symbol: Symbol) -> Option<SubscriptionDelta> {
        let current = self.pane(id)?.symbol.clone();
        if current == symbol {
            return None;
        }

        let before = self.active_symbols();
        let generation = self.bump_generation();
        let timeframe = self.pane(id)?.timeframe;
        self.pane_mut(id)?.rebind(symbol.clone(), timeframe, generation);
        let after = self.active_symbols();

        info!(pane = %id, symbol = %symbol, "pane rebound to symbol");

        Some(SubscriptionDelta {
            subscribe: after.difference(&before).cloned().collect(),
            unsubscribe: before.difference(&after).cloned().collect(),
        })
    }

    /// Rebind a pane to a new timeframe, clearing its series so the next
    /// backfill poll reloads it. Returns false if nothing changed.
    pub fn set_timeframe(&mut self, id: PaneId, timeframe: Timeframe) -> bool {
        let Some(pane) = self.pane(id) else {
            return false;
        };
        if pane.timeframe == timeframe {
            return false;
        }

        let symbol = pane.symbol.clone();
        let generation = self.bump_generation();
        if let Some(pane) = self.pane_mut(id) {
            pane.rebind(symbol, timeframe, generation);
        }
        info!(pane = %id, timeframe = %timeframe, "pane rebound to timeframe");
        true
    }

    /// Apply a backfill batch to every pane bound to the symbol/timeframe.
    ///
    /// A batch whose length equals the last applied length is coalesced
    /// away: partial and duplicate backfill pushes from the feed must not
    /// retrigger recomputation on every poll.
    pub fn on_candle_batch(
        &mut self,
        symbol: &Symbol,
        timeframe: Timeframe,
        candles: &[Candle],
        now: DateTime<Utc>,
    ) -> Vec<AppliedBackfill> {
        let mut applied = Vec::new();

        for pane in &mut self.panes {
            if pane.symbol != *symbol || pane.timeframe != timeframe {
                continue;
            }
            if pane.last_batch_len == Some(candles.len()) {
                continue;
            }

            let superseded_provisional = pane.last_tick.is_some();
            pane.series.replace(candles.to_vec());
            pane.last_batch_len = Some(candles.len());
            if superseded_provisional {
                pane.backfilled_at = Some(now);
            }

            debug!(
                pane = %pane.id,
                candles = candles.len(),
                "backfill batch applied"
            );
            applied.push(AppliedBackfill {
                pane: pane.id,
                generation: pane.generation,
                candle_count: candles.len(),
                superseded_provisional,
            });
        }

        applied
    }

    /// Record the latest tick for every pane bound to its symbol. The
    /// authoritative series is untouched; only the rendered trailing point
    /// changes. Returns true if any pane was updated.
    pub fn on_tick(&mut self, tick: &Tick) -> bool {
        let mut updated = false;
        for pane in &mut self.panes {
            if pane.symbol != tick.symbol {
                continue;
            }
            // Never reorder a tick behind an already-applied newer one
            let is_fresh = pane
                .last_tick
                .as_ref()
                .map(|previous| tick.time >= previous.time)
                .unwrap_or(true);
            if is_fresh {
                pane.last_tick = Some(tick.clone());
                updated = true;
            }
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use smol_str::SmolStr;

    fn candle_at(minute: u32, close: f64) -> Candle {
        Candle {
            open_time: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
                + chrono::Duration::minutes(minute as i64),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    fn batch(len: u32) -> Vec<Candle> {
        (0..len).map(|minute| candle_at(minute, 100.0 + minute as f64)).collect()
    }

    fn manager() -> ChartSurfaceManager {
        ChartSurfaceManager::new(SmolStr::new("BTCUSDT"), Timeframe::M1)
    }

    #[test]
    fn test_layout_clamps_to_one_pane() {
        let mut surface = manager();
        surface.set_layout(3);
        assert_eq!(surface.panes().len(), 1);

        surface.set_layout(4);
        assert_eq!(surface.panes().len(), 4);

        surface.set_layout(0);
        assert_eq!(surface.panes().len(), 1);
    }

    #[test]
    fn test_layout_preserves_primary_binding_and_bumps_generations() {
        let mut surface = manager();
        surface.set_symbol(PaneId(0), SmolStr::new("ETHUSDT"));
        let old_generation = surface.pane_generation(PaneId(0)).unwrap();

        let change = surface.set_layout(2);
        assert_eq!(change.torn_down, vec![PaneId(0)]);
        assert_eq!(surface.panes()[0].symbol, SmolStr::new("ETHUSDT"));
        assert_eq!(surface.panes()[1].symbol, SmolStr::new("ETHUSDT"));
        assert!(surface.pane_generation(PaneId(0)).unwrap() > old_generation);
    }

    #[test]
    fn test_set_symbol_produces_subscription_delta() {
        let mut surface = manager();
        let delta = surface
            .set_symbol(PaneId(0), SmolStr::new("ETHUSDT"))
            .unwrap();

        assert_eq!(delta.subscribe, vec![SmolStr::new("ETHUSDT")]);
        assert_eq!(delta.unsubscribe, vec![SmolStr::new("BTCUSDT")]);

        // Rebinding to the same symbol is a no-op
        assert!(surface.set_symbol(PaneId(0), SmolStr::new("ETHUSDT")).is_none());
    }

    #[test]
    fn test_shared_symbol_not_unsubscribed() {
        let mut surface = manager();
        surface.set_layout(2);

        // Both panes bound to BTCUSDT; rebinding pane 1 must not
        // unsubscribe the symbol pane 0 still uses
        let delta = surface
            .set_symbol(PaneId(1), SmolStr::new("ETHUSDT"))
            .unwrap();
        assert_eq!(delta.subscribe, vec![SmolStr::new("ETHUSDT")]);
        assert!(delta.unsubscribe.is_empty());
    }

    #[test]
    fn test_batch_coalescing_by_length() {
        let mut surface = manager();
        let symbol = SmolStr::new("BTCUSDT");
        let now = Utc::now();

        let applied = surface.on_candle_batch(&symbol, Timeframe::M1, &batch(120), now);
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].candle_count, 120);

        // Same length: duplicate push, coalesced away
        let applied = surface.on_candle_batch(&symbol, Timeframe::M1, &batch(120), now);
        assert!(applied.is_empty());

        // New candle arrived upstream: applied again
        let applied = surface.on_candle_batch(&symbol, Timeframe::M1, &batch(121), now);
        assert_eq!(applied.len(), 1);
    }

    #[test]
    fn test_tick_renders_trailing_point_without_mutating_series() {
        let mut surface = manager();
        let symbol = SmolStr::new("BTCUSDT");
        let now = Utc::now();
        surface.on_candle_batch(&symbol, Timeframe::M1, &batch(10), now);

        let tick = Tick::new("BTCUSDT", 999.0, Utc.with_ymd_and_hms(2025, 6, 1, 13, 0, 0).unwrap());
        assert!(surface.on_tick(&tick));

        let pane = surface.pane(PaneId(0)).unwrap();
        assert_eq!(pane.series().len(), 10);
        let rendered = pane.rendered();
        assert_eq!(rendered.len(), 11);
        assert_eq!(rendered.last().unwrap().close, 999.0);
    }

    #[test]
    fn test_rendered_series_bounded_to_300_points() {
        let mut surface = manager();
        let symbol = SmolStr::new("BTCUSDT");
        let candles: Vec<Candle> = (0..400u32)
            .map(|i| Candle {
                open_time: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
                    + Duration::minutes(i as i64),
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 0.0,
            })
            .collect();
        surface.on_candle_batch(&symbol, Timeframe::M1, &candles, Utc::now());

        let pane = surface.pane(PaneId(0)).unwrap();
        assert_eq!(pane.series().len(), 400);
        assert_eq!(pane.rendered().len(), RENDERED_POINT_BOUND);
    }

    #[test]
    fn test_backfill_flag_expires_after_five_seconds() {
        let mut surface = manager();
        let symbol = SmolStr::new("BTCUSDT");
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap();

        // Tick-derived provisional data exists, then a backfill supersedes it
        surface.on_tick(&Tick::new("BTCUSDT", 100.0, t0));
        surface.on_candle_batch(&symbol, Timeframe::M1, &batch(5), t0);

        let pane = surface.pane(PaneId(0)).unwrap();
        assert!(pane.recently_backfilled(t0 + Duration::seconds(4)));
        assert!(!pane.recently_backfilled(t0 + Duration::seconds(6)));
    }

    #[test]
    fn test_backfill_without_provisional_raises_no_flag() {
        let mut surface = manager();
        let symbol = SmolStr::new("BTCUSDT");
        let now = Utc::now();

        let applied = surface.on_candle_batch(&symbol, Timeframe::M1, &batch(5), now);
        assert!(!applied[0].superseded_provisional);
        assert!(!surface.pane(PaneId(0)).unwrap().recently_backfilled(now));
    }

    #[test]
    fn test_stale_tick_not_reordered_before_fresh_one() {
        let mut surface = manager();
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 5).unwrap();

        surface.on_tick(&Tick::new("BTCUSDT", 101.0, t0));
        let stale = Tick::new("BTCUSDT", 99.0, t0 - Duration::seconds(2));
        assert!(!surface.on_tick(&stale));

        let rendered = surface.pane(PaneId(0)).unwrap().rendered();
        assert_eq!(rendered.last().unwrap().close, 101.0);
    }

    #[test]
    fn test_series_integrity_under_interleaving() {
        let mut surface = manager();
        let symbol = SmolStr::new("BTCUSDT");
        let now = Utc::now();

        surface.on_candle_batch(&symbol, Timeframe::M1, &batch(10), now);
        surface.on_tick(&Tick::new("BTCUSDT", 500.0, now));
        surface.on_candle_batch(&symbol, Timeframe::M1, &batch(12), now);
        surface.on_tick(&Tick::new("BTCUSDT", 501.0, now));

        let pane = surface.pane(PaneId(0)).unwrap();
        assert!(pane.series().is_strictly_ordered());
        assert_eq!(pane.series().len(), 12);
    }
}
