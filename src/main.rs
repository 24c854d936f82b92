// src/main.rs
use std::sync::Arc;

use anyhow::Context;
use dotenvy::dotenv;
use the_sentinel::config::AppConfig;
use the_sentinel::connectors::paper::PaperExecutor;
use the_sentinel::core::circuit_breaker::CircuitBreaker;
use the_sentinel::core::engine::TradingEngine;
use the_sentinel::core::guardian::MarketGuardian;
use the_sentinel::rl::QLearningAgent;
use the_sentinel::strategies::arbiter::DecisionArbiter;
use the_sentinel::strategies::scorer::SignalScorer;
use the_sentinel::types::MarketCycle;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

fn init_logging(log_dir: &str) -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(log_dir, "the_sentinel.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();
    guard
}

/// Streams the feed file into the engine, one cycle at a time.
async fn replay_feed(path: String, cycle_tx: mpsc::Sender<MarketCycle>) -> anyhow::Result<()> {
    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("cannot open feed {}", path))?;
    let mut lines = BufReader::new(file).lines();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let cycle: MarketCycle = match serde_json::from_str(&line) {
            Ok(cycle) => cycle,
            Err(e) => {
                warn!("Skipping feed line {}: {}", line_no, e);
                continue;
            }
        };

        if cycle_tx.send(cycle).await.is_err() {
            break;
        }
    }

    info!("Feed replay finished ({} lines)", line_no);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // 1. Load Configuration
    let config = AppConfig::new().context("failed to load configuration")?;
    let _guard = init_logging(&config.log_dir);

    info!("========================================");
    info!("       THE SENTINEL - v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Target: {}", config.engine.symbol);
    info!("Mode:   📝 PAPER TRADING (feed {})", config.feed_path);

    // 2. Initialize Components
    let breaker = Arc::new(CircuitBreaker::new());
    let guardian = MarketGuardian::new(config.guardian.clone(), Arc::clone(&breaker));
    let arbiter = DecisionArbiter::new(
        config.arbiter.clone(),
        SignalScorer::new(config.scorer.clone()),
        QLearningAgent::new(config.agent.clone()),
        Arc::clone(&breaker),
    )
    .with_model_path(config.engine.model_path.clone());
    let executor = PaperExecutor::new(config.engine.step_size, config.engine.tick_size);

    // 3. Create Channel
    let (cycle_tx, cycle_rx) = mpsc::channel(config.engine.channel_capacity);

    // 4. Run feed and engine; the engine feeds the guardian before each decision
    let feed_task = tokio::spawn(replay_feed(config.feed_path.clone(), cycle_tx));

    // Ctrl+C stops the feed; the engine drains what is queued, then saves
    let feed_abort = feed_task.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping feed...");
            feed_abort.abort();
        }
    });

    let mut engine =
        TradingEngine::new(config.engine.clone(), Box::new(executor), arbiter, cycle_rx)
            .with_guardian(guardian);
    if let Err(e) = engine.run().await {
        error!("Fatal Engine Error: {:#}", e);
    }

    match feed_task.await {
        Ok(Err(e)) => error!("Feed error: {:#}", e),
        Err(e) if !e.is_cancelled() => error!("Feed task failed: {}", e),
        _ => {}
    }

    let agent = engine.strategy().agent().stats();
    let breaker_stats = breaker.stats();
    info!(
        "Closed trades: {}, states learned: {}, episodes: {}, epsilon: {:.4}",
        engine.closed_trades(),
        agent.states,
        agent.episodes,
        agent.epsilon
    );
    info!(
        "Circuit breaker: {} triggers ({} false), downtime {}s, capital saved ${}",
        breaker_stats.total_triggers,
        breaker_stats.false_triggers,
        breaker_stats.total_downtime_secs,
        breaker_stats.capital_saved
    );

    Ok(())
}
