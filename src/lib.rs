// src/lib.rs
//! Decision core of a single-pair crypto trading bot: a technical signal
//! scorer and a tabular Q-learning agent, arbitrated under a market-crash
//! circuit breaker.

pub mod config;
pub mod connectors;
pub mod core;
pub mod errors;
pub mod rl;
pub mod strategies;
pub mod types;
pub mod utils;
