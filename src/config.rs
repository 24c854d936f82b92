// src/config.rs

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::core::engine::EngineConfig;
use crate::core::guardian::GuardianConfig;
use crate::rl::AgentConfig;
use crate::strategies::arbiter::ArbiterConfig;
use crate::strategies::scorer::ScorerConfig;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    /// JSON-lines file of market cycles replayed by the binary.
    pub feed_path: String,
    pub log_dir: String,
    pub scorer: ScorerConfig,
    pub agent: AgentConfig,
    pub arbiter: ArbiterConfig,
    pub guardian: GuardianConfig,
    pub engine: EngineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            feed_path: "data/feed.jsonl".to_string(),
            log_dir: "logs".to_string(),
            scorer: ScorerConfig::default(),
            agent: AgentConfig::default(),
            arbiter: ArbiterConfig::default(),
            guardian: GuardianConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl AppConfig {
    /// Defaults, overlaid by an optional `Settings` file, overlaid by `APP__*` variables
    /// (e.g. `APP__ENGINE__SYMBOL=ETHUSDT`).
    pub fn new() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name("Settings").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn from_toml(settings: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(settings, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}
