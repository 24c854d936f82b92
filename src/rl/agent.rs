// src/rl/agent.rs
//! Tabular Q-learning agent with epsilon-greedy exploration and experience replay.

use std::collections::HashMap;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ModelError;
use crate::rl::model::ModelFile;
use crate::rl::replay::{Experience, ReplayBuffer};
use crate::rl::reward::shaped_reward;
use crate::rl::state::StateKey;
use crate::types::{Action, MarketContext};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    pub learning_rate: f64,
    pub discount_factor: f64,
    pub epsilon: f64,
    pub epsilon_decay: f64,
    pub epsilon_min: f64,
    pub buffer_capacity: usize,
    /// Q-value spread that maps to confidence 1.0.
    pub confidence_scale: f64,
    /// Fixed RNG seed; entropy-seeded when absent.
    pub seed: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            discount_factor: 0.95,
            epsilon: 0.1,
            epsilon_decay: 0.995,
            epsilon_min: 0.01,
            buffer_capacity: 10_000,
            confidence_scale: 10.0,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AgentStats {
    pub states: usize,
    pub episodes: u64,
    pub updates: u64,
    pub total_reward: f64,
    pub epsilon: f64,
    pub buffer_len: usize,
}

pub struct QLearningAgent<R = StdRng> {
    config: AgentConfig,
    q_table: HashMap<StateKey, [f64; 3]>,
    replay: ReplayBuffer,
    epsilon: f64,
    episodes: u64,
    updates: u64,
    total_reward: f64,
    rng: R,
}

impl QLearningAgent<StdRng> {
    pub fn new(config: AgentConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(config, rng)
    }
}

impl<R: Rng> QLearningAgent<R> {
    pub fn with_rng(config: AgentConfig, rng: R) -> Self {
        Self {
            replay: ReplayBuffer::new(config.buffer_capacity),
            epsilon: config.epsilon,
            q_table: HashMap::new(),
            episodes: 0,
            updates: 0,
            total_reward: 0.0,
            config,
            rng,
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            states: self.q_table.len(),
            episodes: self.episodes,
            updates: self.updates,
            total_reward: self.total_reward,
            epsilon: self.epsilon,
            buffer_len: self.replay.len(),
        }
    }

    /// Q-values of a state without creating it.
    pub fn peek(&self, state: &StateKey) -> Option<[f64; 3]> {
        self.q_table.get(state).copied()
    }

    /// Q-values of a state, inserting a zero entry on first visit.
    pub fn q_values(&mut self, state: &StateKey) -> [f64; 3] {
        *self.q_table.entry(*state).or_insert([0.0; 3])
    }

    /// Epsilon-greedy choice. Random actions carry confidence 0; greedy ones
    /// carry the normalized best-worst spread.
    pub fn choose_action(&mut self, state: &StateKey, explore: bool) -> (Action, f64) {
        let values = self.q_values(state);

        if explore && self.rng.gen::<f64>() < self.epsilon {
            let index = self.rng.gen_range(0..Action::ALL.len());
            return (Action::ALL[index], 0.0);
        }

        self.greedy(&values)
    }

    fn greedy(&self, values: &[f64; 3]) -> (Action, f64) {
        let mut best = 0;
        for (i, &value) in values.iter().enumerate().skip(1) {
            // strict > keeps the lowest index on ties
            if value > values[best] {
                best = i;
            }
        }
        let max = values[best];
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);

        let confidence = if self.config.confidence_scale > 0.0 {
            ((max - min) / self.config.confidence_scale).clamp(0.0, 1.0)
        } else {
            0.0
        };
        (Action::ALL[best], confidence)
    }

    /// Q(s,a) += α · (r + γ · max Q(s', ·) − Q(s,a)); the bootstrap term is 0 when `done`.
    pub fn update(
        &mut self,
        state: &StateKey,
        action: Action,
        reward: f64,
        next_state: &StateKey,
        done: bool,
    ) {
        let reward = if reward.is_finite() { reward } else { 0.0 };
        let next_max = if done {
            0.0
        } else {
            self.q_values(next_state)
                .into_iter()
                .fold(f64::NEG_INFINITY, f64::max)
        };

        let alpha = self.config.learning_rate;
        let gamma = self.config.discount_factor;
        let entry = self.q_table.entry(*state).or_insert([0.0; 3]);
        let current = entry[action.index()];
        entry[action.index()] = current + alpha * (reward + gamma * next_max - current);
        self.updates += 1;
    }

    pub fn store_experience(&mut self, experience: Experience) {
        self.replay.push(experience);
    }

    /// Stores a finished transition and learns from it immediately.
    pub fn learn(&mut self, experience: Experience) {
        self.update(
            &experience.state,
            experience.action,
            experience.reward,
            &experience.next_state,
            experience.done,
        );
        self.store_experience(experience);
        self.episodes += 1;
    }

    /// Re-learns from `batch_size` uniformly sampled experiences, then decays
    /// epsilon. Does nothing until the buffer holds a full batch.
    /// Returns the number of updates applied.
    pub fn replay(&mut self, batch_size: usize) -> usize {
        if batch_size == 0 || !self.replay.can_sample(batch_size) {
            return 0;
        }
        let batch = self.replay.sample(&mut self.rng, batch_size);
        for e in &batch {
            self.update(&e.state, e.action, e.reward, &e.next_state, e.done);
        }
        self.decay_epsilon();
        debug!(
            batch = batch.len(),
            epsilon = self.epsilon,
            "Replayed experience batch"
        );
        batch.len()
    }

    pub fn decay_epsilon(&mut self) {
        self.epsilon = self
            .config
            .epsilon_min
            .max(self.epsilon * self.config.epsilon_decay);
    }

    /// Shaped reward for a closed trade; see [`shaped_reward`].
    pub fn reward(&mut self, pnl: f64, streak_bonus: f64, context: Option<&MarketContext>) -> f64 {
        let reward = shaped_reward(pnl, streak_bonus, context);
        self.total_reward += reward;
        reward
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let path = path.as_ref();
        ModelFile::from_table(
            &self.q_table,
            self.epsilon,
            self.episodes,
            self.updates,
            self.total_reward,
        )
        .write(path)?;
        info!(
            "💾 Model saved to {} ({} states, epsilon {:.4})",
            path.display(),
            self.q_table.len(),
            self.epsilon
        );
        Ok(())
    }

    /// Loads a saved model. A missing or unreadable file is not fatal: the
    /// agent is reset to a fresh, empty model and `false` is returned.
    pub fn load(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let loaded = ModelFile::read(path).and_then(|file| {
            let (epsilon, episodes, updates, total_reward) =
                (file.epsilon, file.episodes, file.updates, file.total_reward);
            file.into_table()
                .map(|table| (table, epsilon, episodes, updates, total_reward))
        });

        match loaded {
            Ok((table, epsilon, episodes, updates, total_reward)) => {
                self.q_table = table;
                self.epsilon = epsilon;
                self.episodes = episodes;
                self.updates = updates;
                self.total_reward = total_reward;
                info!(
                    "🧠 Model loaded from {} ({} states, {} episodes, epsilon {:.4})",
                    path.display(),
                    self.q_table.len(),
                    self.episodes,
                    self.epsilon
                );
                true
            }
            Err(e) => {
                warn!(
                    "⚠️ Could not load model from {}: {}. Starting with a fresh model.",
                    path.display(),
                    e
                );
                self.reset();
                false
            }
        }
    }

    /// Drops everything learned and restores the configured epsilon.
    pub fn reset(&mut self) {
        self.q_table.clear();
        self.replay.clear();
        self.epsilon = self.config.epsilon;
        self.episodes = 0;
        self.updates = 0;
        self.total_reward = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BtcTrend, MarketRegime};

    fn key(signal: u8, pnl: u8) -> StateKey {
        StateKey {
            signal,
            rsi: 3,
            macd: 3,
            fear_greed: 2,
            pnl,
            btc_trend: BtcTrend::Sideways,
            regime: MarketRegime::RiskOn,
        }
    }

    fn seeded(epsilon: f64) -> QLearningAgent {
        QLearningAgent::new(AgentConfig {
            epsilon,
            seed: Some(11),
            ..AgentConfig::default()
        })
    }

    #[test]
    fn unseen_state_is_zero_and_ties_pick_lowest_index() {
        let mut agent = seeded(0.0);
        let s = key(3, 3);
        assert_eq!(agent.peek(&s), None);
        assert_eq!(agent.choose_action(&s, true), (Action::Buy, 0.0));
        assert_eq!(agent.peek(&s), Some([0.0; 3]));
        assert_eq!(agent.stats().states, 1);
    }

    #[test]
    fn greedy_confidence_is_normalized_spread() {
        let mut agent = seeded(0.0);
        let s = key(4, 3);
        agent.update(&s, Action::Hold, 10.0, &s, true);
        let (action, confidence) = agent.choose_action(&s, false);
        assert_eq!(action, Action::Hold);
        assert!((confidence - 0.1).abs() < 1e-12);

        for _ in 0..200 {
            agent.update(&s, Action::Hold, 100.0, &s, true);
        }
        assert_eq!(agent.choose_action(&s, false).1, 1.0);
    }

    #[test]
    fn full_exploration_returns_random_actions_with_zero_confidence() {
        let mut agent = seeded(1.0);
        let s = key(2, 3);
        agent.update(&s, Action::Sell, 20.0, &s, true);
        for _ in 0..20 {
            let (_, confidence) = agent.choose_action(&s, true);
            assert_eq!(confidence, 0.0);
        }
        assert_eq!(agent.choose_action(&s, false).0, Action::Sell);
    }

    #[test]
    fn same_seed_same_choices() {
        let s = key(3, 3);
        let picks = |seed| {
            let mut agent = QLearningAgent::new(AgentConfig {
                epsilon: 0.5,
                seed: Some(seed),
                ..AgentConfig::default()
            });
            (0..32)
                .map(|_| agent.choose_action(&s, true))
                .collect::<Vec<_>>()
        };
        assert_eq!(picks(99), picks(99));
    }

    #[test]
    fn update_with_done_ignores_next_state() {
        let mut agent = seeded(0.0);
        let s = key(3, 3);
        let next = key(5, 3);
        agent.update(&next, Action::Buy, 50.0, &next, true);
        assert_eq!(agent.peek(&next).unwrap()[0], 5.0);

        agent.update(&s, Action::Buy, 10.0, &next, true);
        assert_eq!(agent.peek(&s).unwrap()[0], 1.0);

        agent.update(&s, Action::Sell, 10.0, &next, false);
        // 0.1 * (10 + 0.95 * 5)
        assert!((agent.peek(&s).unwrap()[1] - 1.475).abs() < 1e-12);
    }

    #[test]
    fn repeated_reward_converges_to_discounted_sum() {
        let mut agent = seeded(0.0);
        let s = key(3, 3);
        let target = 1.0 / (1.0 - 0.95);
        let mut previous = 0.0;
        for _ in 0..5_000 {
            agent.update(&s, Action::Buy, 1.0, &s, false);
            let q = agent.peek(&s).unwrap()[0];
            assert!(q >= previous);
            assert!(q <= target + 1e-9);
            previous = q;
        }
        assert!((previous - target).abs() < 1e-6);
    }

    #[test]
    fn replay_waits_for_a_full_batch_then_decays_epsilon() {
        let mut agent = seeded(0.5);
        let s = key(3, 3);
        for _ in 0..4 {
            agent.store_experience(Experience {
                state: s,
                action: Action::Buy,
                reward: 10.0,
                next_state: s,
                done: true,
            });
        }
        assert_eq!(agent.replay(8), 0);
        assert_eq!(agent.epsilon(), 0.5);

        assert_eq!(agent.replay(4), 4);
        assert!((agent.epsilon() - 0.5 * 0.995).abs() < 1e-12);
        assert!(agent.peek(&s).unwrap()[0] > 0.0);
    }

    #[test]
    fn epsilon_never_drops_below_min() {
        let mut agent = seeded(0.0105);
        for _ in 0..100 {
            agent.decay_epsilon();
        }
        assert_eq!(agent.epsilon(), 0.01);
    }

    #[test]
    fn learn_counts_episodes_and_buffers() {
        let mut agent = seeded(0.0);
        let s = key(3, 3);
        let reward = agent.reward(0.03, 0.0, None);
        agent.learn(Experience {
            state: s,
            action: Action::Buy,
            reward,
            next_state: key(3, 5),
            done: true,
        });
        let stats = agent.stats();
        assert_eq!(stats.episodes, 1);
        assert_eq!(stats.buffer_len, 1);
        assert_eq!(stats.total_reward, 20.0);
        assert_eq!(agent.peek(&s).unwrap()[0], 2.0);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        let mut agent = seeded(0.3);
        for (i, pnl) in [0.031, -0.004, 0.012, -0.027].into_iter().enumerate() {
            let s = key(i as u8, 3);
            let r = agent.reward(pnl, 0.0, None);
            agent.learn(Experience {
                state: s,
                action: Action::ALL[i % 3],
                reward: r,
                next_state: key(i as u8 + 1, 4),
                done: i % 2 == 0,
            });
        }
        agent.decay_epsilon();
        agent.save(&path).unwrap();

        let mut restored = seeded(0.1);
        assert!(restored.load(&path));
        assert_eq!(restored.q_table, agent.q_table);
        assert_eq!(restored.epsilon(), agent.epsilon());
        assert_eq!(restored.stats().episodes, 4);
        assert_eq!(restored.stats().total_reward, agent.stats().total_reward);
    }

    #[test]
    fn missing_or_corrupt_model_falls_back_to_fresh() {
        let dir = tempfile::tempdir().unwrap();

        let mut agent = seeded(0.2);
        agent.update(&key(1, 1), Action::Sell, 5.0, &key(1, 1), true);
        assert!(!agent.load(dir.path().join("nope.json")));
        assert_eq!(agent.stats().states, 0);
        assert_eq!(agent.epsilon(), 0.2);

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, b"{\"version\": 1, \"q_table\": [").unwrap();
        agent.update(&key(1, 1), Action::Sell, 5.0, &key(1, 1), true);
        assert!(!agent.load(&corrupt));
        assert_eq!(agent.stats().states, 0);
    }
}
