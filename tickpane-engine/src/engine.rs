//! Terminal engine loop.
//!
//! [`Terminal`] owns the chart surface, the overlay engine, the alert
//! monitor and the template snapshot, and drives them from a single
//! logical task: user commands, scheduler ticks and overlay completions
//! all arrive as messages and are processed one at a time. No component
//! state is shared across tasks, so no locking is needed around it; the
//! only concurrency is the overlay recompute tasks, which report back
//! through their own channel.
//!
//! The UI layer talks to the engine exclusively through
//! [`TerminalHandles`]: a command sender, an event receiver for
//! notifications, and a watch receiver carrying the latest
//! [`RenderSnapshot`].

use crate::alert::AlertMonitor;
use crate::event::{PaneView, RenderSnapshot, TerminalEvent};
use crate::feed::{ConnectionState, MarketFeed};
use crate::indicator::IndicatorExecutor;
use crate::overlay::{AppliedOutcome, IndicatorOverlayEngine, RecomputeOutcome};
use crate::scheduler::Scheduler;
use crate::surface::{ChartSurfaceManager, SubscriptionDelta};
use crate::template::{ConfigurationSnapshot, TemplateStore};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tickpane_core::{
    AlertCondition, AlertId, Candle, EngineError, IndicatorParams, IndicatorRef, OverlayId,
    PaneId, Symbol, Tick, Timeframe,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Startup symbol from TICKPANE_SYMBOL (default: BTCUSDT)
fn default_symbol() -> Symbol {
    static SYMBOL: OnceLock<Symbol> = OnceLock::new();
    SYMBOL
        .get_or_init(|| {
            std::env::var("TICKPANE_SYMBOL")
                .map(Symbol::from)
                .unwrap_or_else(|_| Symbol::new("BTCUSDT"))
        })
        .clone()
}

/// Terminal engine configuration
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    /// Symbol the primary pane starts on
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    /// Cadence of the alert sampling task
    pub alert_sample_period: Duration,
    /// Cadence of the candle backfill poll
    pub backfill_poll_period: Duration,
    /// Upper bound on one indicator computation
    pub compute_timeout: Duration,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            timeframe: Timeframe::M1,
            alert_sample_period: Duration::from_secs(1),
            backfill_poll_period: Duration::from_millis(1500),
            compute_timeout: Duration::from_secs(5),
        }
    }
}

impl TerminalConfig {
    pub fn with_binding(mut self, symbol: impl AsRef<str>, timeframe: Timeframe) -> Self {
        self.symbol = Symbol::new(symbol.as_ref());
        self.timeframe = timeframe;
        self
    }

    pub fn with_alert_sample_period(mut self, period: Duration) -> Self {
        self.alert_sample_period = period;
        self
    }

    pub fn with_backfill_poll_period(mut self, period: Duration) -> Self {
        self.backfill_poll_period = period;
        self
    }

    pub fn with_compute_timeout(mut self, timeout: Duration) -> Self {
        self.compute_timeout = timeout;
        self
    }
}

/// Commands accepted by the engine loop
#[derive(Debug, Clone)]
pub enum TerminalCommand {
    /// Switch the pane layout (1, 2 or 4; anything else clamps to 1)
    SetLayout(usize),
    SetSymbol {
        pane: PaneId,
        symbol: Symbol,
    },
    SetTimeframe {
        pane: PaneId,
        timeframe: Timeframe,
    },
    AddOverlay {
        pane: PaneId,
        indicator: IndicatorRef,
        parameters: IndicatorParams,
    },
    RemoveOverlay {
        pane: PaneId,
        overlay: OverlayId,
    },
    ToggleOverlay {
        pane: PaneId,
        overlay: OverlayId,
    },
    SetOverlayParameters {
        pane: PaneId,
        overlay: OverlayId,
        parameters: IndicatorParams,
    },
    CreateAlert {
        symbol: Symbol,
        condition: AlertCondition,
        target_price: f64,
    },
    RearmAlert(AlertId),
    DisarmAlert(AlertId),
    DeleteAlert(AlertId),
    SaveTemplate(String),
    ApplyTemplate(String),
    /// Scheduler tick: sample latest prices and evaluate alerts
    SampleAlerts,
    /// Scheduler tick: refresh candle windows from the feed
    PollBackfill,
    Shutdown,
}

/// The engine's side of the channels created by [`Terminal::new`]
pub struct TerminalHandles {
    pub commands: mpsc::UnboundedSender<TerminalCommand>,
    pub events: mpsc::UnboundedReceiver<TerminalEvent>,
    pub snapshots: watch::Receiver<RenderSnapshot>,
}

/// The charting terminal engine
pub struct Terminal<S: TemplateStore> {
    state: TerminalState<S>,
    command_rx: mpsc::UnboundedReceiver<TerminalCommand>,
    outcome_rx: mpsc::UnboundedReceiver<RecomputeOutcome>,
}

struct TerminalState<S: TemplateStore> {
    config: TerminalConfig,
    feed: Arc<dyn MarketFeed>,
    surface: ChartSurfaceManager,
    overlays: IndicatorOverlayEngine,
    alerts: AlertMonitor,
    templates: ConfigurationSnapshot<S>,
    scheduler: Scheduler,
    command_tx: mpsc::UnboundedSender<TerminalCommand>,
    event_tx: mpsc::UnboundedSender<TerminalEvent>,
    snapshot_tx: watch::Sender<RenderSnapshot>,
    connectivity: ConnectionState,
}

impl<S: TemplateStore> Terminal<S> {
    /// Wire up the engine and the handles the UI layer drives it with
    pub fn new(
        feed: Arc<dyn MarketFeed>,
        executor: Arc<dyn IndicatorExecutor>,
        store: S,
        config: TerminalConfig,
    ) -> (Self, TerminalHandles) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(RenderSnapshot::default());
        let (overlays, outcome_rx) =
            IndicatorOverlayEngine::new(executor, config.compute_timeout);
        let surface = ChartSurfaceManager::new(config.symbol.clone(), config.timeframe);

        let terminal = Self {
            state: TerminalState {
                config,
                feed,
                surface,
                overlays,
                alerts: AlertMonitor::new(),
                templates: ConfigurationSnapshot::new(store),
                scheduler: Scheduler::new(),
                command_tx: command_tx.clone(),
                event_tx,
                snapshot_tx,
                connectivity: ConnectionState::default(),
            },
            command_rx,
            outcome_rx,
        };
        let handles = TerminalHandles {
            commands: command_tx,
            events: event_rx,
            snapshots: snapshot_rx,
        };
        (terminal, handles)
    }

    /// Drive the engine until shutdown. Commands and overlay completions
    /// are interleaved but each is applied to completion before the next.
    pub async fn run(self) {
        let Self {
            mut state,
            mut command_rx,
            mut outcome_rx,
        } = self;

        state.startup().await;

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(TerminalCommand::Shutdown) | None => break,
                    Some(command) => state.handle_command(command).await,
                },
                outcome = outcome_rx.recv() => match outcome {
                    Some(outcome) => state.apply_recompute_outcome(outcome),
                    None => break,
                },
            }
        }

        info!("terminal stopped");
    }
}

impl<S: TemplateStore> TerminalState<S> {
    async fn startup(&mut self) {
        info!(symbol = %self.config.symbol, timeframe = %self.config.timeframe, "terminal started");

        let initial: Vec<Symbol> = self.surface.active_symbols().into_iter().collect();
        self.feed.subscribe(&initial).await;

        self.scheduler.schedule(
            "alert-sampling",
            self.config.alert_sample_period,
            self.command_tx.clone(),
            TerminalCommand::SampleAlerts,
        );
        self.scheduler.schedule(
            "backfill-poll",
            self.config.backfill_poll_period,
            self.command_tx.clone(),
            TerminalCommand::PollBackfill,
        );

        self.poll_backfill().await;
    }

    async fn handle_command(&mut self, command: TerminalCommand) {
        match command {
            TerminalCommand::SetLayout(pane_count) => {
                let change = self.surface.set_layout(pane_count);
                for pane in &change.torn_down {
                    self.overlays.release_pane(*pane);
                }
                self.apply_subscription_delta(&change.delta).await;
                self.poll_backfill().await;
            }
            TerminalCommand::SetSymbol { pane, symbol } => {
                if let Some(delta) = self.surface.set_symbol(pane, symbol) {
                    self.overlays.cancel_pane(pane);
                    self.apply_subscription_delta(&delta).await;
                    self.poll_backfill().await;
                }
            }
            TerminalCommand::SetTimeframe { pane, timeframe } => {
                if self.surface.set_timeframe(pane, timeframe) {
                    self.overlays.cancel_pane(pane);
                    self.poll_backfill().await;
                }
            }
            TerminalCommand::AddOverlay {
                pane,
                indicator,
                parameters,
            } => {
                self.overlays.add_overlay(pane, indicator, parameters);
                self.recompute_pane(pane);
                self.publish_snapshot();
            }
            TerminalCommand::RemoveOverlay { pane, overlay } => {
                self.overlays.remove_overlay(pane, overlay);
                self.publish_snapshot();
            }
            TerminalCommand::ToggleOverlay { pane, overlay } => {
                if self.overlays.toggle_visible(pane, overlay) == Some(true) {
                    self.recompute_pane(pane);
                }
                self.publish_snapshot();
            }
            TerminalCommand::SetOverlayParameters {
                pane,
                overlay,
                parameters,
            } => {
                if self.overlays.set_parameters(pane, overlay, parameters) {
                    self.recompute_pane(pane);
                }
                self.publish_snapshot();
            }
            TerminalCommand::CreateAlert {
                symbol,
                condition,
                target_price,
            } => {
                self.feed.subscribe(std::slice::from_ref(&symbol)).await;
                self.alerts.create(symbol, condition, target_price);
                self.publish_snapshot();
            }
            TerminalCommand::RearmAlert(id) => {
                self.alerts.rearm(id);
                self.publish_snapshot();
            }
            TerminalCommand::DisarmAlert(id) => {
                self.alerts.disarm(id);
                self.publish_snapshot();
            }
            TerminalCommand::DeleteAlert(id) => {
                self.delete_alert(id).await;
                self.publish_snapshot();
            }
            TerminalCommand::SaveTemplate(name) => self.save_template(name),
            TerminalCommand::ApplyTemplate(name) => self.apply_template(name).await,
            TerminalCommand::SampleAlerts => self.sample_alerts().await,
            TerminalCommand::PollBackfill => self.poll_backfill().await,
            TerminalCommand::Shutdown => {}
        }
    }

    /// Subscribe additions and drop removals, except symbols an alert
    /// still watches: those must keep ticking even when no pane shows them
    async fn apply_subscription_delta(&self, delta: &SubscriptionDelta) {
        self.feed.subscribe(&delta.subscribe).await;

        let watched = self.alerts.watched_symbols();
        let unsubscribe: Vec<Symbol> = delta
            .unsubscribe
            .iter()
            .filter(|symbol| !watched.contains(*symbol))
            .cloned()
            .collect();
        self.feed.unsubscribe(&unsubscribe).await;
    }

    async fn delete_alert(&mut self, id: AlertId) {
        let symbol = self
            .alerts
            .alerts()
            .find(|alert| alert.id == id)
            .map(|alert| alert.symbol.clone());
        if !self.alerts.delete(id) {
            return;
        }

        // Drop the subscription if nothing else needs the symbol
        if let Some(symbol) = symbol {
            let still_needed = self.surface.active_symbols().contains(&symbol)
                || self.alerts.watched_symbols().contains(&symbol);
            if !still_needed {
                self.feed.unsubscribe(std::slice::from_ref(&symbol)).await;
            }
        }
    }

    fn save_template(&mut self, name: String) {
        let Some(template) = self.templates.capture(name.as_str(), &self.surface, &self.overlays)
        else {
            return;
        };
        let event = match self.templates.save(template) {
            Ok(()) => TerminalEvent::TemplateSaved { name },
            Err(error) => TerminalEvent::TemplateError(error),
        };
        let _ = self.event_tx.send(event);
    }

    async fn apply_template(&mut self, name: String) {
        let template = match self.templates.find(&name) {
            Ok(Some(template)) => template,
            Ok(None) => {
                let _ = self.event_tx.send(TerminalEvent::TemplateError(
                    EngineError::Template(format!("no template named '{name}'")),
                ));
                return;
            }
            Err(error) => {
                let _ = self.event_tx.send(TerminalEvent::TemplateError(error));
                return;
            }
        };

        debug!(name = %template.name, "applying chart template");
        let change = self.surface.set_layout(template.layout);
        for pane in &change.torn_down {
            self.overlays.release_pane(*pane);
        }
        self.apply_subscription_delta(&change.delta).await;

        let primary = PaneId(0);
        if let Some(delta) = self.surface.set_symbol(primary, template.symbol.clone()) {
            self.apply_subscription_delta(&delta).await;
        }
        self.surface.set_timeframe(primary, template.timeframe);

        for overlay in &template.overlays {
            self.overlays.add_overlay(
                primary,
                overlay.indicator.clone(),
                overlay.parameters.clone(),
            );
        }

        self.poll_backfill().await;
        let _ = self.event_tx.send(TerminalEvent::TemplateApplied { name });
    }

    /// One sampling cycle: take a single latest-tick snapshot and feed it
    /// to both the rendered trailing points and the alert evaluation, so
    /// the chart and the alerts always agree on what was observed.
    async fn sample_alerts(&mut self) {
        let mut symbols = self.surface.active_symbols();
        symbols.extend(self.alerts.watched_symbols());

        let mut ticks: HashMap<Symbol, Tick> = HashMap::new();
        for symbol in symbols {
            if let Some(tick) = self.feed.latest_tick(&symbol).await {
                ticks.insert(symbol, tick);
            }
        }

        for tick in ticks.values() {
            self.surface.on_tick(tick);
        }
        for fired in self.alerts.evaluate(&ticks, Utc::now()) {
            let _ = self.event_tx.send(TerminalEvent::AlertFired {
                alert: fired.alert,
                price: fired.price,
            });
        }

        self.refresh_connectivity();
        self.publish_snapshot();
    }

    /// One backfill cycle: fetch a candle window per distinct pane binding
    /// and apply it; each applied batch triggers an overlay recompute
    /// against the pane's generation at application time.
    async fn poll_backfill(&mut self) {
        let bindings: Vec<(Symbol, Timeframe)> = self
            .surface
            .panes()
            .iter()
            .map(|pane| (pane.symbol.clone(), pane.timeframe))
            .collect();

        let mut fetched: Vec<(Symbol, Timeframe, Vec<Candle>)> = Vec::new();
        for (symbol, timeframe) in bindings {
            let already = fetched
                .iter()
                .any(|(s, t, _)| *s == symbol && *t == timeframe);
            if already {
                continue;
            }
            if let Some(candles) = self.feed.candles(&symbol, timeframe).await {
                fetched.push((symbol, timeframe, candles));
            }
        }

        let now = Utc::now();
        for (symbol, timeframe, candles) in &fetched {
            for applied in self.surface.on_candle_batch(symbol, *timeframe, candles, now) {
                if applied.superseded_provisional {
                    let _ = self.event_tx.send(TerminalEvent::Backfilled {
                        pane: applied.pane,
                        candles: applied.candle_count,
                    });
                }
                let window = self
                    .surface
                    .pane(applied.pane)
                    .map(|pane| pane.series().as_slice().to_vec());
                if let Some(window) = window {
                    self.overlays
                        .recompute(applied.pane, applied.generation, &window);
                }
            }
        }

        self.refresh_connectivity();
        self.publish_snapshot();
    }

    /// Trigger a recompute from the pane's current series (overlay added
    /// or re-shown between backfill polls)
    fn recompute_pane(&mut self, pane: PaneId) {
        let Some(state) = self.surface.pane(pane) else {
            return;
        };
        if state.series().as_slice().is_empty() {
            return;
        }
        let window = state.series().as_slice().to_vec();
        let generation = state.generation;
        self.overlays.recompute(pane, generation, &window);
    }

    fn apply_recompute_outcome(&mut self, outcome: RecomputeOutcome) {
        let pane = match &outcome {
            RecomputeOutcome::OverlayResult { pane, .. } => *pane,
            RecomputeOutcome::BatchComplete { pane, .. } => *pane,
        };
        let generation = self.surface.pane_generation(pane);

        match self.overlays.apply_outcome(outcome, generation) {
            AppliedOutcome::Updated { .. } => self.publish_snapshot(),
            AppliedOutcome::Failed {
                pane,
                overlay,
                display_name,
                error,
            } => {
                let _ = self.event_tx.send(TerminalEvent::OverlayError {
                    pane,
                    overlay,
                    display_name,
                    error,
                });
                self.publish_snapshot();
            }
            AppliedOutcome::Discarded | AppliedOutcome::BatchComplete { .. } => {}
        }
    }

    fn refresh_connectivity(&mut self) {
        let state = self.feed.connection_state();
        if state != self.connectivity {
            info!(state = state.label(), "feed connectivity changed");
            self.connectivity = state;
            let _ = self
                .event_tx
                .send(TerminalEvent::ConnectivityChanged(state));
        }
    }

    fn publish_snapshot(&self) {
        let now = Utc::now();
        let panes = self
            .surface
            .panes()
            .iter()
            .map(|pane| PaneView {
                id: pane.id,
                symbol: pane.symbol.clone(),
                timeframe: pane.timeframe,
                candles: pane.rendered(),
                overlays: self.overlays.views(pane.id),
                recently_backfilled: pane.recently_backfilled(now),
            })
            .collect();

        let _ = self.snapshot_tx.send(RenderSnapshot {
            panes,
            alerts: self.alerts.alerts().cloned().collect(),
            connectivity: self.connectivity,
        });
    }
}
