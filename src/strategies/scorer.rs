// src/strategies/scorer.rs
use serde::{Deserialize, Serialize};

use crate::types::{Action, IndicatorSnapshot};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScorerConfig {
    /// |strength| needed for a BUY/SELL direction.
    pub threshold: i32,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self { threshold: 3 }
    }
}

/// Output of [`SignalScorer::score`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalScore {
    pub direction: Action,
    pub strength: i32,
}

/// Weighted vote over the technical indicators.
///
/// Weights: MACD ±1, VWAP ±1, EMA9/EMA21 ±1, EMA9/SMA50 ±2, EMA21/SMA50 ±3,
/// RSI extremes ±1, Bollinger breakouts ±1. The total is bounded to [-10, 10].
#[derive(Debug, Clone, Default)]
pub struct SignalScorer {
    config: ScorerConfig,
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// +weight when `a > b`, -weight otherwise; 0 when either side is missing.
fn trend_vote(a: f64, b: f64, weight: i32) -> i32 {
    match (finite(a), finite(b)) {
        (Some(a), Some(b)) if a > b => weight,
        (Some(_), Some(_)) => -weight,
        _ => 0,
    }
}

impl SignalScorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self { config }
    }

    pub fn threshold(&self) -> i32 {
        self.config.threshold
    }

    pub fn score(&self, snapshot: &IndicatorSnapshot) -> SignalScore {
        let strength = Self::strength(snapshot);
        SignalScore {
            direction: self.direction(strength),
            strength,
        }
    }

    pub fn direction(&self, strength: i32) -> Action {
        if strength >= self.config.threshold {
            Action::Buy
        } else if strength <= -self.config.threshold {
            Action::Sell
        } else {
            Action::Hold
        }
    }

    /// Signed sum of the indicator votes. Inputs that are NaN/inf abstain.
    pub fn strength(snapshot: &IndicatorSnapshot) -> i32 {
        let s = snapshot;
        let mut strength = 0;

        if let (Some(macd), Some(signal), Some(hist)) =
            (finite(s.macd), finite(s.macd_signal), finite(s.macd_histogram))
        {
            if macd > signal && hist > 0.0 {
                strength += 1;
            } else if macd < signal && hist < 0.0 {
                strength -= 1;
            }
        }

        strength += trend_vote(s.price, s.vwap, 1);
        strength += trend_vote(s.ema9, s.ema21, 1);
        strength += trend_vote(s.ema9, s.sma50, 2);
        strength += trend_vote(s.ema21, s.sma50, 3);

        let rsi = finite(s.rsi).unwrap_or(50.0);
        if rsi < 30.0 {
            strength += 1;
        } else if rsi > 70.0 {
            strength -= 1;
        }

        if let Some(price) = finite(s.price) {
            if finite(s.bb_lower).is_some_and(|lower| price < lower) {
                strength += 1;
            } else if finite(s.bb_upper).is_some_and(|upper| price > upper) {
                strength -= 1;
            }
        }

        strength
    }
}
