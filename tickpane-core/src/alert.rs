/// Price alerts and their arm/fire lifecycle
///
/// An alert transitions `Armed -> Fired` at most once per activation.
/// Once `fired_at` is set, `active` is false and stays false until the
/// user explicitly re-arms, which clears `fired_at`.
use crate::types::Symbol;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Identifier of a price alert
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    derive_more::Display, derive_more::From, derive_more::Constructor,
)]
#[display("alert-{_0}")]
pub struct AlertId(pub u64);

/// Trigger condition relative to the target price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum AlertCondition {
    /// Fires when price >= target
    Above,
    /// Fires when price <= target
    Below,
}

impl AlertCondition {
    pub fn is_satisfied(&self, price: f64, target: f64) -> bool {
        match self {
            AlertCondition::Above => price >= target,
            AlertCondition::Below => price <= target,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AlertCondition::Above => "above",
            AlertCondition::Below => "below",
        }
    }
}

/// A user-defined price alert
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PriceAlert {
    pub id: AlertId,
    pub symbol: Symbol,
    pub condition: AlertCondition,
    pub target_price: f64,
    pub active: bool,
    pub fired_at: Option<DateTime<Utc>>,
}

impl PriceAlert {
    pub fn new(
        id: AlertId,
        symbol: impl AsRef<str>,
        condition: AlertCondition,
        target_price: f64,
    ) -> Self {
        Self {
            id,
            symbol: SmolStr::new(symbol),
            condition,
            target_price,
            active: true,
            fired_at: None,
        }
    }

    /// Armed means eligible to trigger on the next sample
    pub fn is_armed(&self) -> bool {
        self.active && self.fired_at.is_none()
    }

    /// Record the trigger. Invariant: after firing, `active` is false and
    /// `fired_at` is set until an explicit re-arm.
    pub fn fire(&mut self, at: DateTime<Utc>) {
        self.fired_at = Some(at);
        self.active = false;
    }

    /// Explicit user re-arm: clears the fired marker and re-activates
    pub fn rearm(&mut self) {
        self.fired_at = None;
        self.active = true;
    }

    pub fn disarm(&mut self) {
        self.active = false;
    }
}
