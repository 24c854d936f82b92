// src/strategies/traits.rs
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::rl::StateKey;
use crate::strategies::arbiter::DecisionResult;
use crate::types::{Action, MarketContext, MarketCycle, Position};

/// A round trip the engine has just closed, handed back to the strategy for learning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub entry_state: StateKey,
    pub entry_action: Action,
    pub exit_state: StateKey,
    /// Realized P&L as a fraction of entry.
    pub pnl: f64,
    pub streak_bonus: f64,
    pub context: Option<MarketContext>,
}

pub trait Strategy: Send {
    fn name(&self) -> String;

    // Restore learned state (e.g. load a model)
    fn init(&mut self) -> Result<()>;

    // Decide what to do this cycle
    fn on_cycle(&mut self, cycle: &MarketCycle, position: Option<&Position>) -> DecisionResult;

    // Learn from a closed trade, returns the reward it earned
    fn on_trade_closed(&mut self, trade: &ClosedTrade) -> f64;

    // Persist learned state
    fn checkpoint(&self) -> Result<()>;
}
