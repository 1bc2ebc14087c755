//! Signal generation.
//!
//! A strategy is any [`SignalProvider`]: a pure function from a candle
//! history prefix to a [`Signal`]. The engine never inspects which strategy
//! it runs; callers pick one by name through the [`StrategyRegistry`].

pub mod indicators;
mod ml;
mod momentum;
mod pivot;
mod reversion;
mod trend;

pub use ml::{ForestConfig, MlClassifier};
pub use momentum::{BotHunter, MomentumStrategy, PriceAction};
pub use pivot::{CamarillaLevels, PivotLevels};
pub use reversion::{MeanReversion, VwapReversion};
pub use trend::{EmaCross, EmaRsiAtr, SmaCross};

use crate::config::StrategyConfig;
use crate::market::Candle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
            Side::Hold => write!(f, "hold"),
        }
    }
}

/// Exit level attached to a tiered entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitTarget {
    pub label: String,
    pub price: Decimal,
    /// Share of the original entry quantity sold at this level. The last
    /// target always closes whatever remains.
    pub fraction: Decimal,
}

/// Entry classification and exit ladder for multi-position strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPlan {
    pub tag: String,
    pub targets: Vec<ExitTarget>,
}

/// Trade signal for the bar that ends the evaluated history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub side: Side,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<EntryPlan>,
}

impl Signal {
    pub fn new(side: Side, confidence: f64) -> Self {
        Self {
            side,
            confidence,
            reason: None,
            entry: None,
        }
    }

    pub fn buy(confidence: f64) -> Self {
        Self::new(Side::Buy, confidence)
    }

    pub fn sell(confidence: f64) -> Self {
        Self::new(Side::Sell, confidence)
    }

    pub fn hold(confidence: f64) -> Self {
        Self::new(Side::Hold, confidence)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_entry(mut self, entry: EntryPlan) -> Self {
        self.entry = Some(entry);
        self
    }

    /// Reject NaN or out-of-range confidence.
    pub fn validate(&self) -> Result<(), SignalError> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(SignalError::InvalidConfidence(self.confidence));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("confidence {0} is outside [0, 1]")]
    InvalidConfidence(f64),
    #[error("{indicator} produced a non-finite value")]
    NonFinite { indicator: &'static str },
    #[error("unknown strategy '{name}' (available: {available})")]
    UnknownStrategy { name: String, available: String },
    #[error("strategy failed: {0}")]
    Failed(String),
}

/// Source of per-bar trade signals.
///
/// `evaluate` must depend only on `history`, whose last element is the bar
/// being decided. The engine never calls it with fewer than `min_lookback`
/// bars.
pub trait SignalProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn min_lookback(&self) -> usize;

    fn evaluate(&self, history: &[Candle]) -> Result<Signal, SignalError>;
}

/// Name → provider lookup.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    providers: BTreeMap<&'static str, Arc<dyn SignalProvider>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in strategy, parameterized from config.
    pub fn with_defaults(config: &StrategyConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SmaCross::new(config.sma_fast, config.sma_slow)));
        registry.register(Arc::new(EmaCross::new(config.ema_fast, config.ema_slow)));
        registry.register(Arc::new(EmaRsiAtr::new(
            config.ema_fast,
            config.ema_slow,
            config.rsi_period,
            config.atr_period,
        )));
        registry.register(Arc::new(MomentumStrategy::default()));
        registry.register(Arc::new(MeanReversion::new(config.rsi_period)));
        registry.register(Arc::new(VwapReversion::new(config.vwap_window)));
        registry.register(Arc::new(PriceAction));
        registry.register(Arc::new(BotHunter::default()));
        registry.register(Arc::new(PivotLevels::new(config.pivot_window)));
        registry.register(Arc::new(MlClassifier::default()));
        registry
    }

    /// Add or replace a provider under its own name.
    pub fn register(&mut self, provider: Arc<dyn SignalProvider>) {
        self.providers.insert(provider.name(), provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn SignalProvider>, SignalError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| SignalError::UnknownStrategy {
                name: name.to_string(),
                available: self.names().join(", "),
            })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.providers.keys().copied().collect()
    }
}

/// Turn a non-finite indicator into a typed error.
pub(crate) fn finite(value: f64, indicator: &'static str) -> Result<f64, SignalError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(SignalError::NonFinite { indicator })
    }
}
