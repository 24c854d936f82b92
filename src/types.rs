// src/types.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::precision::pnl_fraction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

/// Trade action shared by the scorer, the agent and the arbiter.
///
/// The discriminants are the Q-table column indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy = 0,
    Sell = 1,
    Hold = 2,
}

impl Action {
    pub const ALL: [Action; 3] = [Action::Buy, Action::Sell, Action::Hold];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Action> {
        Self::ALL.get(index).copied()
    }

    /// Order side for actions that trade; `None` for HOLD.
    pub fn side(self) -> Option<Side> {
        match self {
            Action::Buy => Some(Side::Buy),
            Action::Sell => Some(Side::Sell),
            Action::Hold => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
            Action::Hold => "HOLD",
        };
        f.write_str(name)
    }
}

fn nan() -> f64 {
    f64::NAN
}

/// One cycle worth of technical indicators.
///
/// Fields missing from the feed deserialize as NaN (indicator still warming up).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    #[serde(default = "nan")]
    pub price: f64,
    #[serde(default = "nan")]
    pub rsi: f64,
    #[serde(default = "nan")]
    pub macd: f64,
    #[serde(default = "nan")]
    pub macd_signal: f64,
    #[serde(default = "nan")]
    pub macd_histogram: f64,
    #[serde(default = "nan")]
    pub vwap: f64,
    #[serde(default = "nan")]
    pub ema9: f64,
    #[serde(default = "nan")]
    pub ema21: f64,
    #[serde(default = "nan")]
    pub sma50: f64,
    #[serde(default = "nan")]
    pub bb_upper: f64,
    #[serde(default = "nan")]
    pub bb_middle: f64,
    #[serde(default = "nan")]
    pub bb_lower: f64,
    #[serde(default = "nan")]
    pub volume: f64,
}

impl Default for IndicatorSnapshot {
    fn default() -> Self {
        Self {
            price: f64::NAN,
            rsi: f64::NAN,
            macd: f64::NAN,
            macd_signal: f64::NAN,
            macd_histogram: f64::NAN,
            vwap: f64::NAN,
            ema9: f64::NAN,
            ema21: f64::NAN,
            sma50: f64::NAN,
            bb_upper: f64::NAN,
            bb_middle: f64::NAN,
            bb_lower: f64::NAN,
            volume: f64::NAN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketTrend {
    Bullish,
    Bearish,
    #[default]
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BtcTrend {
    UpStrong,
    UpWeak,
    Sideways,
    DownWeak,
    DownStrong,
    #[default]
    Unknown,
}

impl BtcTrend {
    pub fn label(self) -> &'static str {
        match self {
            BtcTrend::UpStrong => "up_strong",
            BtcTrend::UpWeak => "up_weak",
            BtcTrend::Sideways => "sideways",
            BtcTrend::DownWeak => "down_weak",
            BtcTrend::DownStrong => "down_strong",
            BtcTrend::Unknown => "unknown",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let trend = match label {
            "up_strong" => BtcTrend::UpStrong,
            "up_weak" => BtcTrend::UpWeak,
            "sideways" => BtcTrend::Sideways,
            "down_weak" => BtcTrend::DownWeak,
            "down_strong" => BtcTrend::DownStrong,
            "unknown" => BtcTrend::Unknown,
            _ => return None,
        };
        Some(trend)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    RiskOn,
    RiskOff,
    #[default]
    Neutral,
}

impl MarketRegime {
    pub fn label(self) -> &'static str {
        match self {
            MarketRegime::RiskOn => "risk_on",
            MarketRegime::RiskOff => "risk_off",
            MarketRegime::Neutral => "neutral",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "risk_on" => Some(MarketRegime::RiskOn),
            "risk_off" => Some(MarketRegime::RiskOff),
            "neutral" => Some(MarketRegime::Neutral),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Volatility {
    High,
    Medium,
    #[default]
    Low,
}

/// Broad market conditions, refreshed on a minutes scale by the market-data fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketContext {
    pub btc_price: f64,
    pub btc_change_24h: f64,
    pub eth_price: f64,
    pub eth_change_24h: f64,
    pub fear_greed_index: f64,
    pub market_trend: MarketTrend,
    pub btc_trend: BtcTrend,
    pub market_regime: MarketRegime,
    pub volatility: Volatility,
}

impl Default for MarketContext {
    fn default() -> Self {
        Self {
            btc_price: 0.0,
            btc_change_24h: 0.0,
            eth_price: 0.0,
            eth_change_24h: 0.0,
            fear_greed_index: 50.0,
            market_trend: MarketTrend::Neutral,
            btc_trend: BtcTrend::Unknown,
            market_regime: MarketRegime::Neutral,
            volatility: Volatility::Low,
        }
    }
}

impl MarketContext {
    /// Builds a context and derives its labels from the raw 24h moves (percent) and
    /// the Fear & Greed index.
    pub fn from_market(
        btc_price: f64,
        btc_change_24h: f64,
        eth_price: f64,
        eth_change_24h: f64,
        fear_greed_index: f64,
    ) -> Self {
        Self {
            btc_price,
            btc_change_24h,
            eth_price,
            eth_change_24h,
            fear_greed_index,
            market_trend: Self::classify_trend(btc_change_24h, eth_change_24h),
            btc_trend: Self::classify_btc_trend(btc_change_24h),
            market_regime: Self::classify_regime(fear_greed_index),
            volatility: Self::classify_volatility(btc_change_24h, eth_change_24h),
        }
    }

    pub fn classify_trend(btc_change: f64, eth_change: f64) -> MarketTrend {
        let avg_change = (btc_change + eth_change) / 2.0;
        if avg_change > 3.0 {
            MarketTrend::Bullish
        } else if avg_change < -3.0 {
            MarketTrend::Bearish
        } else {
            MarketTrend::Neutral
        }
    }

    pub fn classify_btc_trend(btc_change: f64) -> BtcTrend {
        if btc_change.is_nan() {
            BtcTrend::Unknown
        } else if btc_change > 5.0 {
            BtcTrend::UpStrong
        } else if btc_change > 1.0 {
            BtcTrend::UpWeak
        } else if btc_change < -5.0 {
            BtcTrend::DownStrong
        } else if btc_change < -1.0 {
            BtcTrend::DownWeak
        } else {
            BtcTrend::Sideways
        }
    }

    pub fn classify_regime(fear_greed_index: f64) -> MarketRegime {
        if fear_greed_index.is_nan() {
            MarketRegime::Neutral
        } else if fear_greed_index < 35.0 {
            MarketRegime::RiskOff
        } else {
            MarketRegime::RiskOn
        }
    }

    pub fn classify_volatility(btc_change: f64, eth_change: f64) -> Volatility {
        let max_change = btc_change.abs().max(eth_change.abs());
        if max_change > 7.0 {
            Volatility::High
        } else if max_change > 3.0 {
            Volatility::Medium
        } else {
            Volatility::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    #[default]
    #[serde(rename = "NONE")]
    Flat,
    Short,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    /// Unrealized P&L as a fraction of entry (0.02 == +2%).
    pub unrealized_pnl: f64,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn open(symbol: String, side: PositionSide, quantity: Decimal, entry_price: Decimal) -> Self {
        Self {
            symbol,
            side,
            quantity,
            entry_price,
            unrealized_pnl: 0.0,
            opened_at: Utc::now(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.side != PositionSide::Flat && !self.quantity.is_zero()
    }

    /// Marks the position at `price` and returns the new unrealized P&L fraction.
    pub fn revalue(&mut self, price: Decimal) -> f64 {
        self.unrealized_pnl = pnl_fraction(self.side, self.entry_price, price);
        self.unrealized_pnl
    }

    /// The action that closes this position.
    pub fn exit_action(&self) -> Action {
        match self.side {
            PositionSide::Long => Action::Sell,
            PositionSide::Short => Action::Buy,
            PositionSide::Flat => Action::Hold,
        }
    }
}

/// One record of the market feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketCycle {
    pub timestamp: DateTime<Utc>,
    pub snapshot: IndicatorSnapshot,
    #[serde(default)]
    pub context: Option<MarketContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub status: String,
}
