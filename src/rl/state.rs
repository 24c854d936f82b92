// src/rl/state.rs
//! Discretization of market conditions into Q-table keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::StateKeyParseError;
use crate::strategies::scorer::SignalScorer;
use crate::types::{BtcTrend, IndicatorSnapshot, MarketContext, MarketRegime, Position};

pub const SIGNAL_BINS: [f64; 6] = [-10.0, -3.0, -1.0, 1.0, 3.0, 10.0];
pub const RSI_BINS: [f64; 5] = [30.0, 40.0, 50.0, 60.0, 70.0];
pub const MACD_BINS: [f64; 5] = [-0.1, -0.01, 0.0, 0.01, 0.1];
pub const FEAR_GREED_BINS: [f64; 4] = [25.0, 45.0, 55.0, 75.0];
pub const PNL_BINS: [f64; 5] = [-0.05, -0.02, 0.0, 0.02, 0.05];

/// Index of the first threshold `value` is strictly below; the last bucket
/// catches everything at or above the final threshold. NaN takes `neutral`.
pub fn bucket(value: f64, bins: &[f64], neutral: f64) -> u8 {
    let value = if value.is_nan() { neutral } else { value };
    bins.iter()
        .position(|&threshold| value < threshold)
        .unwrap_or(bins.len()) as u8
}

/// Finite, hashable market state used to index the Q-table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateKey {
    pub signal: u8,
    pub rsi: u8,
    pub macd: u8,
    pub fear_greed: u8,
    pub pnl: u8,
    pub btc_trend: BtcTrend,
    pub regime: MarketRegime,
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sig:{}|rsi:{}|macd:{}|fg:{}|pnl:{}|btc:{}|regime:{}",
            self.signal,
            self.rsi,
            self.macd,
            self.fear_greed,
            self.pnl,
            self.btc_trend.label(),
            self.regime.label()
        )
    }
}

fn field<'a>(part: &'a str, name: &'static str) -> Result<&'a str, StateKeyParseError> {
    part.strip_prefix(name)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or_else(|| StateKeyParseError::UnexpectedField {
            expected: name,
            found: part.to_string(),
        })
}

fn bucket_field(part: &str, name: &'static str, bins: usize) -> Result<u8, StateKeyParseError> {
    let raw = field(part, name)?;
    match raw.parse::<u8>() {
        Ok(index) if (index as usize) <= bins => Ok(index),
        _ => Err(StateKeyParseError::Bucket(raw.to_string())),
    }
}

impl FromStr for StateKey {
    type Err = StateKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('|').collect();
        if parts.len() != 7 {
            return Err(StateKeyParseError::FieldCount(parts.len()));
        }
        let btc = field(parts[5], "btc")?;
        let regime = field(parts[6], "regime")?;
        Ok(Self {
            signal: bucket_field(parts[0], "sig", SIGNAL_BINS.len())?,
            rsi: bucket_field(parts[1], "rsi", RSI_BINS.len())?,
            macd: bucket_field(parts[2], "macd", MACD_BINS.len())?,
            fear_greed: bucket_field(parts[3], "fg", FEAR_GREED_BINS.len())?,
            pnl: bucket_field(parts[4], "pnl", PNL_BINS.len())?,
            btc_trend: BtcTrend::from_label(btc)
                .ok_or_else(|| StateKeyParseError::Label(btc.to_string()))?,
            regime: MarketRegime::from_label(regime)
                .ok_or_else(|| StateKeyParseError::Label(regime.to_string()))?,
        })
    }
}

impl Serialize for StateKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StateKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Maps a snapshot, the market context and the open position to a [`StateKey`].
///
/// Pure and total: NaN and out-of-range inputs land in well-defined buckets.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateDiscretizer;

impl StateDiscretizer {
    pub fn discretize(
        &self,
        snapshot: &IndicatorSnapshot,
        context: Option<&MarketContext>,
        position: Option<&Position>,
    ) -> StateKey {
        let strength = SignalScorer::strength(snapshot) as f64;
        let fear_greed = context.map_or(50.0, |c| c.fear_greed_index);
        let pnl = position
            .filter(|p| p.is_open())
            .map_or(0.0, |p| p.unrealized_pnl);

        StateKey {
            signal: bucket(strength, &SIGNAL_BINS, 0.0),
            rsi: bucket(snapshot.rsi, &RSI_BINS, 50.0),
            macd: bucket(snapshot.macd_histogram, &MACD_BINS, 0.0),
            fear_greed: bucket(fear_greed, &FEAR_GREED_BINS, 50.0),
            pnl: bucket(pnl, &PNL_BINS, 0.0),
            btc_trend: context.map_or(BtcTrend::Unknown, |c| c.btc_trend),
            regime: context.map_or(MarketRegime::Neutral, |c| c.market_regime),
        }
    }
}
