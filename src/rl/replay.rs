// src/rl/replay.rs
//! Bounded experience replay buffer.

use std::collections::VecDeque;

use rand::seq::index;
use rand::Rng;

use crate::rl::state::StateKey;
use crate::types::Action;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Experience {
    pub state: StateKey,
    pub action: Action,
    pub reward: f64,
    pub next_state: StateKey,
    pub done: bool,
}

/// Ring buffer: once full, each push evicts the oldest experience.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    buffer: VecDeque<Experience>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, experience: Experience) {
        if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(experience);
    }

    /// Uniform sample without replacement. Returns fewer than `batch_size`
    /// items only when the buffer holds fewer.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, batch_size: usize) -> Vec<Experience> {
        let amount = batch_size.min(self.buffer.len());
        index::sample(rng, self.buffer.len(), amount)
            .into_iter()
            .map(|i| self.buffer[i])
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn can_sample(&self, batch_size: usize) -> bool {
        self.buffer.len() >= batch_size
    }

    pub fn iter(&self) -> impl Iterator<Item = &Experience> {
        self.buffer.iter()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
