//! Alert monitor.
//!
//! Samples the latest tick per watched symbol on a fixed cadence and
//! evaluates every armed alert for that symbol. An alert fires at most
//! once per activation: the transition sets `fired_at`, clears `active`
//! and emits exactly one notification. Re-arming is an explicit user
//! action that clears `fired_at`.
//!
//! The monitor never alerts on stale data: a symbol whose latest tick has
//! not advanced since the previous sample is skipped, because no price
//! transition could have been observed across the samples.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap};
use tickpane_core::{AlertCondition, AlertId, PriceAlert, Symbol, Tick};
use tracing::{debug, info};

/// One fired alert, paired with the price that triggered it
#[derive(Debug, Clone, PartialEq)]
pub struct FiredAlert {
    pub alert: PriceAlert,
    pub price: f64,
}

/// Owns the alert set and its sampling state
#[derive(Debug, Default)]
pub struct AlertMonitor {
    alerts: IndexMap<AlertId, PriceAlert>,
    /// Tick time last observed per symbol, for the freshness gate
    last_observed: HashMap<Symbol, DateTime<Utc>>,
    next_id: u64,
}

impl AlertMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new armed alert
    pub fn create(
        &mut self,
        symbol: impl AsRef<str>,
        condition: AlertCondition,
        target_price: f64,
    ) -> AlertId {
        self.next_id += 1;
        let id = AlertId(self.next_id);
        let alert = PriceAlert::new(id, symbol, condition, target_price);
        info!(
            alert = %id,
            symbol = %alert.symbol,
            condition = alert.condition.label(),
            target = target_price,
            "alert armed"
        );
        self.alerts.insert(id, alert);
        id
    }

    /// Explicit re-arm: clears `fired_at`, making the alert eligible again
    pub fn rearm(&mut self, id: AlertId) -> bool {
        match self.alerts.get_mut(&id) {
            Some(alert) => {
                alert.rearm();
                true
            }
            None => false,
        }
    }

    pub fn disarm(&mut self, id: AlertId) -> bool {
        match self.alerts.get_mut(&id) {
            Some(alert) => {
                alert.disarm();
                true
            }
            None => false,
        }
    }

    pub fn delete(&mut self, id: AlertId) -> bool {
        self.alerts.shift_remove(&id).is_some()
    }

    pub fn alerts(&self) -> impl Iterator<Item = &PriceAlert> {
        self.alerts.values()
    }

    /// Symbols any alert (armed or not) is watching, for feed sampling
    pub fn watched_symbols(&self) -> BTreeSet<Symbol> {
        self.alerts
            .values()
            .map(|alert| alert.symbol.clone())
            .collect()
    }

    /// Evaluate every armed alert against the latest tick snapshot.
    ///
    /// Pure given its inputs and the current alert set, and idempotent per
    /// alert: a fired alert never re-notifies until explicitly re-armed,
    /// and a symbol with no fresh tick since the last sample is skipped.
    pub fn evaluate(&mut self, latest_ticks: &HashMap<Symbol, Tick>, now: DateTime<Utc>) -> Vec<FiredAlert> {
        // Freshness gate first: a symbol qualifies for this cycle only if
        // its tick advanced past what the previous sample observed
        let mut fresh: HashMap<&Symbol, f64> = HashMap::new();
        for (symbol, tick) in latest_ticks {
            let advanced = self
                .last_observed
                .get(symbol)
                .map(|seen| tick.time > *seen)
                .unwrap_or(true);
            if advanced {
                fresh.insert(symbol, tick.price);
                self.last_observed.insert(symbol.clone(), tick.time);
            }
        }

        let mut fired = Vec::new();
        for alert in self.alerts.values_mut() {
            if !alert.is_armed() {
                continue;
            }
            let Some(price) = fresh.get(&alert.symbol).copied() else {
                continue;
            };
            if alert.condition.is_satisfied(price, alert.target_price) {
                alert.fire(now);
                info!(
                    alert = %alert.id,
                    symbol = %alert.symbol,
                    price,
                    target = alert.target_price,
                    "alert fired"
                );
                fired.push(FiredAlert {
                    alert: alert.clone(),
                    price,
                });
            } else {
                debug!(alert = %alert.id, price, "alert sampled, condition not met");
            }
        }

        fired
    }
}
