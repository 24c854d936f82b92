// src/rl/reward.rs
//! Reward shaping for closed trades.

use serde::{Deserialize, Serialize};

use crate::types::{MarketContext, MarketTrend};

/// P&L beyond which a trade counts as a large win/loss (2%).
pub const LARGE_MOVE: f64 = 0.02;
pub const STREAK_LENGTH: u32 = 3;
pub const STREAK_BONUS: f64 = 5.0;
pub const TREND_ALIGNMENT_BONUS: f64 = 2.0;

/// Tiered reward for a realized `pnl` fraction.
///
/// `> +2%` → 20, `(0, 2%]` → 10, `[-2%, 0)` → -10, `< -2%` → -20, break-even → 0.
/// `streak_bonus` is added as is; a bullish market adds 2 to a win and a
/// bearish market takes 2 from a loss.
pub fn shaped_reward(pnl: f64, streak_bonus: f64, context: Option<&MarketContext>) -> f64 {
    let pnl = if pnl.is_nan() { 0.0 } else { pnl };
    let streak_bonus = if streak_bonus.is_finite() { streak_bonus } else { 0.0 };

    let mut reward = if pnl > LARGE_MOVE {
        20.0
    } else if pnl > 0.0 {
        10.0
    } else if pnl < -LARGE_MOVE {
        -20.0
    } else if pnl < 0.0 {
        -10.0
    } else {
        0.0
    };

    reward += streak_bonus;

    if let Some(ctx) = context {
        match ctx.market_trend {
            MarketTrend::Bullish if pnl > 0.0 => reward += TREND_ALIGNMENT_BONUS,
            MarketTrend::Bearish if pnl < 0.0 => reward -= TREND_ALIGNMENT_BONUS,
            _ => {}
        }
    }

    reward
}

/// Consecutive win/loss bookkeeping, owned by whoever closes trades.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeStreak {
    pub wins: u32,
    pub losses: u32,
}

impl TradeStreak {
    /// Records a realized P&L and returns the streak bonus that applies to it.
    /// Break-even trades leave both counters untouched.
    pub fn record(&mut self, pnl: f64) -> f64 {
        if pnl > 0.0 {
            self.wins += 1;
            self.losses = 0;
        } else if pnl < 0.0 {
            self.losses += 1;
            self.wins = 0;
        }
        self.bonus()
    }

    pub fn bonus(&self) -> f64 {
        if self.wins >= STREAK_LENGTH {
            STREAK_BONUS
        } else if self.losses >= STREAK_LENGTH {
            -STREAK_BONUS
        } else {
            0.0
        }
    }
}
