// src/rl/model.rs
//! Versioned on-disk format of a trained agent.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ModelError;
use crate::rl::state::StateKey;

pub const MODEL_VERSION: u32 = 1;

/// JSON model: state key text → [BUY, SELL, HOLD] values, plus epsilon and counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFile {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub epsilon: f64,
    pub episodes: u64,
    pub updates: u64,
    pub total_reward: f64,
    pub q_table: BTreeMap<String, [f64; 3]>,
}

impl ModelFile {
    pub fn from_table(
        table: &HashMap<StateKey, [f64; 3]>,
        epsilon: f64,
        episodes: u64,
        updates: u64,
        total_reward: f64,
    ) -> Self {
        Self {
            version: MODEL_VERSION,
            saved_at: Utc::now(),
            epsilon,
            episodes,
            updates,
            total_reward,
            q_table: table
                .iter()
                .map(|(key, values)| (key.to_string(), *values))
                .collect(),
        }
    }

    /// Parses the keys back and checks every number is usable.
    pub fn into_table(self) -> Result<HashMap<StateKey, [f64; 3]>, ModelError> {
        if self.version != MODEL_VERSION {
            return Err(ModelError::UnsupportedVersion {
                found: self.version,
                expected: MODEL_VERSION,
            });
        }
        if !(0.0..=1.0).contains(&self.epsilon) {
            return Err(ModelError::InvalidValue(format!("epsilon {}", self.epsilon)));
        }
        self.q_table
            .into_iter()
            .map(|(raw, values)| {
                if values.iter().any(|v| !v.is_finite()) {
                    return Err(ModelError::InvalidValue(format!("q-values of {}", raw)));
                }
                Ok((raw.parse::<StateKey>()?, values))
            })
            .collect()
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Writes through a sibling temp file and renames it over `path`.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
