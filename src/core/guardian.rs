// src/core/guardian.rs
//! Crash monitor driving the circuit breaker from BTC/ETH price samples.
//!
//! Each asset keeps a rolling window of prices. The drawdown from the window
//! high decides the breaker transitions: warning, trigger, and after a calm
//! stabilization period, recovery and clear.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::circuit_breaker::{CircuitBreaker, CircuitBreakerStatus};
use crate::types::MarketCycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Btc,
    Eth,
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Btc => write!(f, "BTC"),
            Asset::Eth => write!(f, "ETH"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub asset: Asset,
    pub price: f64,
    pub at: DateTime<Utc>,
}

impl PriceSample {
    /// BTC and ETH samples carried by a cycle's market context.
    pub fn from_cycle(cycle: &MarketCycle) -> Vec<PriceSample> {
        let Some(ctx) = &cycle.context else {
            return Vec::new();
        };
        [(Asset::Btc, ctx.btc_price), (Asset::Eth, ctx.eth_price)]
            .into_iter()
            .filter(|(_, price)| *price > 0.0)
            .map(|(asset, price)| PriceSample {
                asset,
                price,
                at: cycle.timestamp,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardianConfig {
    /// Drop from the window high (percent) that trips the breaker.
    pub trigger_drop_pct: f64,
    pub warning_drop_pct: f64,
    pub window_minutes: i64,
    /// Calm time required before recovery, and again before clearing.
    pub stabilization_minutes: i64,
    /// Exposure used to estimate the capital a trigger saved.
    pub capital_at_risk: Decimal,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            trigger_drop_pct: 15.0,
            warning_drop_pct: 10.0,
            window_minutes: 60,
            stabilization_minutes: 30,
            capital_at_risk: Decimal::from(1000),
        }
    }
}

/// Drawdown of the latest price against the window high.
#[derive(Debug, Clone, Copy)]
struct Drawdown {
    pct: f64,
    high: f64,
    price: f64,
    minutes: i64,
}

pub struct MarketGuardian {
    config: GuardianConfig,
    breaker: Arc<CircuitBreaker>,
    windows: HashMap<Asset, VecDeque<PriceSample>>,
    calm_since: Option<DateTime<Utc>>,
    trigger_drop_pct: f64,
}

impl MarketGuardian {
    pub fn new(config: GuardianConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            config,
            breaker,
            windows: HashMap::new(),
            calm_since: None,
            trigger_drop_pct: 0.0,
        }
    }

    pub fn circuit_breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    /// Feeds one price sample and applies the resulting breaker transition.
    pub fn observe(&mut self, sample: PriceSample) -> CircuitBreakerStatus {
        if !sample.price.is_finite() || sample.price <= 0.0 {
            warn!("Ignoring invalid {} price sample: {}", sample.asset, sample.price);
            return self.breaker.status();
        }

        self.windows.entry(sample.asset).or_default().push_back(sample);
        self.expire(sample.at);

        self.breaker.touch(sample.at);

        let Some(current) = self.drawdown(sample.asset) else {
            return self.breaker.status();
        };
        debug!(asset = %sample.asset, drawdown = current.pct, "Guardian sample");

        if current.pct >= self.config.trigger_drop_pct {
            let reason = format!(
                "{} dropped {:.1}% in {}min",
                sample.asset, current.pct, current.minutes
            );
            let details = json!({
                "asset": sample.asset,
                "drawdown_pct": current.pct,
                "window_high": current.high,
                "price": current.price,
                "minutes": current.minutes,
            });
            if self
                .breaker
                .trigger_at(&reason, details, Some(self.market_snapshot()), sample.at)
            {
                self.trigger_drop_pct = current.pct;
            }
            self.calm_since = None;
            return self.breaker.status();
        }

        let worst = self.worst_drawdown();
        let calm = worst.map_or(true, |(_, d)| d.pct < self.config.warning_drop_pct);

        match self.breaker.status() {
            CircuitBreakerStatus::Safe => {
                if let Some((asset, d)) = worst.filter(|_| !calm) {
                    self.breaker.set_warning_at(
                        &format!("{} down {:.1}% in {}min", asset, d.pct, d.minutes),
                        json!({ "asset": asset, "drawdown_pct": d.pct }),
                        sample.at,
                    );
                }
            }
            CircuitBreakerStatus::Warning => {
                if calm {
                    self.breaker.clear_warning();
                }
            }
            status @ (CircuitBreakerStatus::Triggered | CircuitBreakerStatus::Recovering) => {
                if !calm {
                    self.calm_since = None;
                    return status;
                }
                let since = *self.calm_since.get_or_insert(sample.at);
                if sample.at - since >= Duration::minutes(self.config.stabilization_minutes) {
                    if status == CircuitBreakerStatus::Triggered {
                        self.breaker.start_recovery_at(sample.at);
                        self.calm_since = Some(sample.at);
                    } else {
                        let saved = self.capital_saved();
                        self.breaker.clear_at(saved, sample.at);
                        self.calm_since = None;
                        self.trigger_drop_pct = 0.0;
                    }
                }
            }
        }

        self.breaker.status()
    }

    /// Consumes samples until every sender is dropped.
    pub async fn run(mut self, mut rx: mpsc::Receiver<PriceSample>) {
        info!(
            "🛡️ Market guardian running (trigger {}%, warning {}%, window {}min)",
            self.config.trigger_drop_pct, self.config.warning_drop_pct, self.config.window_minutes
        );
        while let Some(sample) = rx.recv().await {
            self.observe(sample);
        }
        info!("Market guardian stopped: price feed closed");
    }

    /// Drops samples older than the window from every asset, and assets that went quiet.
    fn expire(&mut self, now: DateTime<Utc>) {
        let horizon = now - Duration::minutes(self.config.window_minutes);
        for window in self.windows.values_mut() {
            while window.front().is_some_and(|s| s.at < horizon) {
                window.pop_front();
            }
        }
        self.windows.retain(|_, window| !window.is_empty());
    }

    fn drawdown(&self, asset: Asset) -> Option<Drawdown> {
        let window = self.windows.get(&asset)?;
        let last = window.back()?;
        let peak = window
            .iter()
            .max_by(|a, b| a.price.total_cmp(&b.price))?;
        Some(Drawdown {
            pct: (peak.price - last.price) / peak.price * 100.0,
            high: peak.price,
            price: last.price,
            minutes: (last.at - peak.at).num_minutes().max(0),
        })
    }

    fn worst_drawdown(&self) -> Option<(Asset, Drawdown)> {
        [Asset::Btc, Asset::Eth]
            .into_iter()
            .filter_map(|asset| self.drawdown(asset).map(|d| (asset, d)))
            .max_by(|a, b| a.1.pct.total_cmp(&b.1.pct))
    }

    fn market_snapshot(&self) -> Value {
        let mut prices = Map::new();
        for (asset, window) in &self.windows {
            if let Some(last) = window.back() {
                prices.insert(asset.to_string(), json!(last.price));
            }
        }
        Value::Object(prices)
    }

    fn capital_saved(&self) -> Decimal {
        let fraction = Decimal::from_f64(self.trigger_drop_pct / 100.0)
            .unwrap_or_default()
            .round_dp(4);
        (self.config.capital_at_risk * fraction).round_dp(2)
    }
}
