// src/strategies/arbiter.rs
//! Merges the technical score, the RL recommendation, the open position and
//! the circuit breaker into one action with an audit trail.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::circuit_breaker::{CircuitBreaker, CircuitBreakerStatus};
use crate::rl::{Experience, QLearningAgent, StateDiscretizer, StateKey};
use crate::strategies::scorer::{SignalScore, SignalScorer};
use crate::strategies::traits::{ClosedTrade, Strategy};
use crate::types::{Action, IndicatorSnapshot, MarketContext, MarketCycle, Position};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// RL confidence below this always holds.
    pub min_confidence: f64,
    /// RL confidence above which an RL exit recommendation closes a position.
    pub exit_confidence: f64,
    /// Let the agent explore (epsilon-greedy) when deciding.
    pub explore: bool,
    /// Experiences replayed after each closed trade.
    pub replay_batch_size: usize,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.3,
            exit_confidence: 0.5,
            explore: false,
            replay_batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionResult {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: Action,
    pub reasoning: Vec<String>,
    pub confidence: f64,
    pub technical: Option<SignalScore>,
    pub rl_action: Option<Action>,
    pub state_key: Option<StateKey>,
    pub circuit_breaker: CircuitBreakerStatus,
}

impl DecisionResult {
    /// An empty HOLD decision.
    pub fn new(circuit_breaker: CircuitBreakerStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action: Action::Hold,
            reasoning: Vec::new(),
            confidence: 0.0,
            technical: None,
            rl_action: None,
            state_key: None,
            circuit_breaker,
        }
    }

    fn reason(&mut self, reason: impl Into<String>) {
        self.reasoning.push(reason.into());
    }
}

pub struct DecisionArbiter<R = StdRng> {
    config: ArbiterConfig,
    scorer: SignalScorer,
    discretizer: StateDiscretizer,
    agent: QLearningAgent<R>,
    circuit_breaker: Arc<CircuitBreaker>,
    model_path: Option<PathBuf>,
}

impl<R: Rng + Send> DecisionArbiter<R> {
    pub fn new(
        config: ArbiterConfig,
        scorer: SignalScorer,
        agent: QLearningAgent<R>,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            config,
            scorer,
            discretizer: StateDiscretizer,
            agent,
            circuit_breaker,
            model_path: None,
        }
    }

    pub fn with_model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = Some(path.into());
        self
    }

    pub fn agent(&self) -> &QLearningAgent<R> {
        &self.agent
    }

    pub fn agent_mut(&mut self) -> &mut QLearningAgent<R> {
        &mut self.agent
    }

    pub fn state_key(
        &self,
        snapshot: &IndicatorSnapshot,
        context: Option<&MarketContext>,
        position: Option<&Position>,
    ) -> StateKey {
        self.discretizer.discretize(snapshot, context, position)
    }

    pub fn decide(
        &mut self,
        snapshot: &IndicatorSnapshot,
        context: Option<&MarketContext>,
        position: Option<&Position>,
    ) -> DecisionResult {
        // 1. Safety first
        let status = self.circuit_breaker.status();
        let mut result = DecisionResult::new(status);
        if status != CircuitBreakerStatus::Safe {
            let breaker = self.circuit_breaker.snapshot();
            result.reason(format!(
                "circuit breaker active ({}): {} - HOLD",
                breaker.status,
                breaker.trigger_reason.as_deref().unwrap_or("no reason recorded")
            ));
            return result;
        }

        // 2. Technical signal
        let technical = self.scorer.score(snapshot);
        result.technical = Some(technical);
        result.reason(format!(
            "Technical signal: {} (strength {})",
            technical.direction, technical.strength
        ));

        // 3. RL recommendation
        let key = self.discretizer.discretize(snapshot, context, position);
        let (rl_action, confidence) = self.agent.choose_action(&key, self.config.explore);
        result.state_key = Some(key);
        result.rl_action = Some(rl_action);
        result.confidence = confidence;
        result.reason(format!(
            "RL recommendation: {} (confidence {:.2}, state {})",
            rl_action, confidence, key
        ));

        // 4. Confidence gate
        if confidence < self.config.min_confidence {
            result.reason(format!(
                "insufficient confidence: {:.2} < {:.2} - HOLD",
                confidence, self.config.min_confidence
            ));
            return result;
        }

        let threshold = self.scorer.threshold();
        match position.filter(|p| p.is_open()) {
            // 5. Flat: technical and RL must agree on a strong signal
            None => {
                if technical.direction != Action::Hold
                    && rl_action == technical.direction
                    && technical.strength.abs() >= threshold
                {
                    result.action = rl_action;
                    result.reason(format!(
                        "Strong {} signal confirmed by RL - opening position",
                        rl_action
                    ));
                } else {
                    result.reason(format!(
                        "waiting for stronger signal (technical {} {}, RL {}) - HOLD",
                        technical.direction, technical.strength, rl_action
                    ));
                }
            }
            // 6. Manage the open position
            Some(pos) => {
                let exit = pos.exit_action();
                let pnl = pos.unrealized_pnl;
                let opposing = technical.direction == exit && technical.strength.abs() >= threshold;

                if pnl < 0.0 && technical.direction == Action::Hold {
                    result.action = exit;
                    result.reason(format!(
                        "Negative PnL ({:+.2}%) with HOLD signal - closing to cut loss and prevent further loss",
                        pnl * 100.0
                    ));
                } else if pnl > 0.0 && technical.direction == Action::Hold {
                    result.reason(format!(
                        "Positive PnL ({:+.2}%) - letting winner run - HOLD",
                        pnl * 100.0
                    ));
                } else if opposing {
                    result.action = exit;
                    result.reason(format!(
                        "Strong {} signal against {:?} position - closing",
                        technical.direction, pos.side
                    ));
                } else if rl_action == exit && confidence > self.config.exit_confidence {
                    result.action = exit;
                    result.reason(format!(
                        "RL strongly recommends exit (confidence {:.2}) - closing",
                        confidence
                    ));
                } else {
                    result.reason(format!("Holding position (PnL {:+.2}%)", pnl * 100.0));
                }
            }
        }

        // 7. The breaker has the last word
        if result.action != Action::Hold {
            let status = self.circuit_breaker.status();
            if status != CircuitBreakerStatus::Safe {
                result.circuit_breaker = status;
                result.reason(format!(
                    "circuit breaker active ({}) before execution - {} overridden with HOLD",
                    status, result.action
                ));
                result.action = Action::Hold;
            }
        }

        debug!(action = %result.action, confidence = result.confidence, "Decision made");
        result
    }

    /// Rewards the agent for a closed trade and replays past experience.
    pub fn learn_from_trade(&mut self, trade: &ClosedTrade) -> f64 {
        let reward = self
            .agent
            .reward(trade.pnl, trade.streak_bonus, trade.context.as_ref());
        self.agent.learn(Experience {
            state: trade.entry_state,
            action: trade.entry_action,
            reward,
            next_state: trade.exit_state,
            done: true,
        });
        self.agent.replay(self.config.replay_batch_size);

        let stats = self.agent.stats();
        info!(
            "🧠 Learned from trade: PnL {:+.2}% → reward {:+.1} (states: {}, episodes: {}, epsilon: {:.4})",
            trade.pnl * 100.0,
            reward,
            stats.states,
            stats.episodes,
            stats.epsilon
        );
        reward
    }
}

impl<R: Rng + Send> Strategy for DecisionArbiter<R> {
    fn name(&self) -> String {
        "RL Decision Arbiter".to_string()
    }

    fn init(&mut self) -> Result<()> {
        match &self.model_path {
            Some(path) if path.exists() => {
                self.agent.load(path);
            }
            Some(path) => info!("No saved model at {}, starting fresh", path.display()),
            None => {}
        }
        Ok(())
    }

    fn on_cycle(&mut self, cycle: &MarketCycle, position: Option<&Position>) -> DecisionResult {
        self.decide(&cycle.snapshot, cycle.context.as_ref(), position)
    }

    fn on_trade_closed(&mut self, trade: &ClosedTrade) -> f64 {
        self.learn_from_trade(trade)
    }

    fn checkpoint(&self) -> Result<()> {
        if let Some(path) = &self.model_path {
            self.agent.save(path)?;
        }
        Ok(())
    }
}
