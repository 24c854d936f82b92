// src/core/engine.rs
use std::path::PathBuf;
use std::sync::Arc;

use crate::connectors::traits::ExecutionHandler;
use crate::core::circuit_breaker::CircuitBreaker;
use crate::core::guardian::{MarketGuardian, PriceSample};
use crate::rl::{StateDiscretizer, StateKey, TradeStreak};
use crate::strategies::arbiter::DecisionResult;
use crate::strategies::traits::{ClosedTrade, Strategy};
use crate::types::{Action, MarketCycle, Position, PositionSide, Side};
use crate::utils::precision::{pnl_fraction, price_to_decimal, realized_pnl};
use anyhow::Result;
use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub symbol: String,
    pub order_size_usdt: Decimal,
    pub min_notional: Decimal,
    pub step_size: Decimal,
    pub tick_size: Decimal,
    pub model_path: String,
    pub state_path: String,
    /// Save the model every N closed trades.
    pub save_every_trades: u64,
    pub channel_capacity: usize,
    /// Loss fraction that closes a position; it fires early, at 80% of this.
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    /// Realized loss, as a fraction of `starting_balance`, that stops trading for the day.
    pub max_daily_loss_pct: f64,
    /// Balance the daily loss limit is measured against; zero disables the limit.
    pub starting_balance: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            order_size_usdt: Decimal::from(100),
            min_notional: Decimal::new(55, 1),
            step_size: Decimal::new(1, 5),
            tick_size: Decimal::new(1, 2),
            model_path: "data/q_model.json".to_string(),
            state_path: "data/engine_state.json".to_string(),
            save_every_trades: 10,
            channel_capacity: 100,
            stop_loss_pct: 0.02,
            take_profit_pct: 0.05,
            max_daily_loss_pct: 0.05,
            starting_balance: Decimal::from(1000),
        }
    }
}

/// Share of the stop loss at which a losing position is cut.
const EARLY_STOP_FRACTION: f64 = 0.8;

/// State key and action a position was opened with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntryMark {
    pub state: StateKey,
    pub action: Action,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EngineState {
    active_position: Option<Position>,
    #[serde(default)]
    entry: Option<EntryMark>,
    #[serde(default)]
    streak: TradeStreak,
    #[serde(default)]
    trading_day: Option<NaiveDate>,
    #[serde(default)]
    daily_pnl: Decimal,
}

pub struct TradingEngine<S> {
    config: EngineConfig,
    execution_handler: Box<dyn ExecutionHandler>,
    strategy: S,
    cycle_receiver: mpsc::Receiver<MarketCycle>,
    position: Option<Position>,
    entry: Option<EntryMark>,
    streak: TradeStreak,
    closed_trades: u64,
    trading_day: Option<NaiveDate>,
    daily_pnl: Decimal,
    circuit_breaker: Arc<CircuitBreaker>,
    guardian: Option<MarketGuardian>,
    state_file: PathBuf,
}

impl<S> TradingEngine<S>
where
    S: Strategy,
{
    pub fn new(
        config: EngineConfig,
        execution_handler: Box<dyn ExecutionHandler>,
        strategy: S,
        cycle_receiver: mpsc::Receiver<MarketCycle>,
    ) -> Self {
        Self {
            state_file: PathBuf::from(&config.state_path),
            config,
            execution_handler,
            strategy,
            cycle_receiver,
            position: None,
            entry: None,
            streak: TradeStreak::default(),
            closed_trades: 0,
            trading_day: None,
            daily_pnl: Decimal::ZERO,
            circuit_breaker: Arc::new(CircuitBreaker::new()),
            guardian: None,
        }
    }

    /// Guardian that sees each cycle's BTC/ETH prices before the decision.
    /// Its breaker is the one stamped on decisions the engine makes itself.
    pub fn with_guardian(mut self, guardian: MarketGuardian) -> Self {
        self.circuit_breaker = guardian.circuit_breaker();
        self.guardian = Some(guardian);
        self
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn streak(&self) -> TradeStreak {
        self.streak
    }

    pub fn closed_trades(&self) -> u64 {
        self.closed_trades
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Realized USD P&L of the current trading day.
    pub fn daily_pnl(&self) -> Decimal {
        self.daily_pnl
    }

    async fn load_state(&mut self) {
        if let Ok(data) = tokio::fs::read_to_string(&self.state_file).await {
            match serde_json::from_str::<EngineState>(&data) {
                Ok(state) => {
                    info!("Restored state: {:?}", state);
                    self.position = state.active_position.filter(|p| p.is_open());
                    self.entry = state.entry;
                    self.streak = state.streak;
                    self.trading_day = state.trading_day;
                    self.daily_pnl = state.daily_pnl;
                }
                Err(e) => warn!("Ignoring unreadable state file {}: {}", self.state_file.display(), e),
            }
        }
    }

    async fn save_state(&self) {
        let state = EngineState {
            active_position: self.position.clone(),
            entry: self.entry,
            streak: self.streak,
            trading_day: self.trading_day,
            daily_pnl: self.daily_pnl,
        };
        if let Some(dir) = self.state_file.parent().filter(|d| !d.as_os_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                error!("Failed to create state directory: {}", e);
                return;
            }
        }
        if let Ok(data) = serde_json::to_string_pretty(&state) {
            if let Err(e) = tokio::fs::write(&self.state_file, data).await {
                error!("Failed to save bot state: {}", e);
            }
        }
    }

    fn checkpoint(&self) {
        if let Err(e) = self.strategy.checkpoint() {
            error!("Failed to save model: {:#}", e);
        }
    }

    /// Resets the daily P&L when the cycle belongs to a new UTC day.
    fn roll_day(&mut self, day: NaiveDate) {
        if self.trading_day == Some(day) {
            return;
        }
        if self.trading_day.is_some() {
            info!("New trading day {}: daily PnL ${} reset", day, self.daily_pnl);
        }
        self.trading_day = Some(day);
        self.daily_pnl = Decimal::ZERO;
    }

    fn daily_limit_reached(&self) -> bool {
        if self.daily_pnl >= Decimal::ZERO {
            return false;
        }
        (-self.daily_pnl)
            .checked_div(self.config.starting_balance)
            .and_then(|loss| loss.to_f64())
            .is_some_and(|loss| loss >= self.config.max_daily_loss_pct)
    }

    /// Stop-loss and take-profit exits, decided before the strategy is asked.
    fn risk_exit(&self, cycle: &MarketCycle) -> Option<DecisionResult> {
        let pos = self.position.as_ref().filter(|p| p.is_open())?;
        let pnl = pos.unrealized_pnl;
        let stop = self.config.stop_loss_pct * EARLY_STOP_FRACTION;

        let reason = if pnl < -stop {
            format!(
                "Stop loss: PnL {:+.2}% below -{:.2}% - cutting loss early",
                pnl * 100.0,
                stop * 100.0
            )
        } else if pnl > self.config.take_profit_pct {
            format!(
                "Take profit target reached: PnL {:+.2}% above {:.2}% - closing",
                pnl * 100.0,
                self.config.take_profit_pct * 100.0
            )
        } else {
            return None;
        };

        let mut decision = DecisionResult::new(self.circuit_breaker.status());
        decision.action = pos.exit_action();
        decision.state_key =
            Some(StateDiscretizer.discretize(&cycle.snapshot, cycle.context.as_ref(), Some(pos)));
        decision.reasoning.push(reason);
        Some(decision)
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Engine starting ({})...", self.strategy.name());
        self.load_state().await;
        self.strategy.init()?;

        info!("Engine loop running on {} (paper execution)", self.config.symbol);

        while let Some(cycle) = self.cycle_receiver.recv().await {
            self.on_cycle(cycle).await?;
        }

        info!(
            "Feed closed after {} closed trades. Saving model and state.",
            self.closed_trades
        );
        self.checkpoint();
        self.save_state().await;
        Ok(())
    }

    /// Runs one decision cycle. Cycles without a usable price are skipped.
    pub async fn on_cycle(&mut self, cycle: MarketCycle) -> Result<Option<DecisionResult>> {
        if let Some(guardian) = self.guardian.as_mut() {
            for sample in PriceSample::from_cycle(&cycle) {
                guardian.observe(sample);
            }
        }

        let Some(price) = price_to_decimal(cycle.snapshot.price) else {
            warn!("Skipping cycle at {}: no usable price", cycle.timestamp);
            return Ok(None);
        };

        self.roll_day(cycle.timestamp.date_naive());
        if let Some(pos) = self.position.as_mut() {
            pos.revalue(price);
        }

        if self.daily_limit_reached() {
            let reason = format!(
                "daily loss limit reached (${} of ${}) - no trading until tomorrow - HOLD",
                self.daily_pnl, self.config.starting_balance
            );
            warn!("🛑 {}", reason);
            let mut decision = DecisionResult::new(self.circuit_breaker.status());
            decision.reasoning.push(reason);
            return Ok(Some(decision));
        }

        let decision = match self.risk_exit(&cycle) {
            Some(decision) => decision,
            None => self.strategy.on_cycle(&cycle, self.position.as_ref()),
        };
        for reason in &decision.reasoning {
            debug!("  {}", reason);
        }
        info!(
            "Decision {}: {} (confidence {:.2}, breaker {})",
            cycle.timestamp, decision.action, decision.confidence, decision.circuit_breaker
        );

        match (decision.action.side(), self.position.clone()) {
            (None, _) => {}
            (Some(_), Some(pos)) if decision.action == pos.exit_action() => {
                self.close_position(pos, price, &decision, &cycle).await;
            }
            (Some(_), Some(pos)) => {
                debug!("Already {:?} on {}; ignoring {}", pos.side, pos.symbol, decision.action);
            }
            (Some(side), None) => {
                self.open_position(side, price, &decision).await;
            }
        }

        Ok(Some(decision))
    }

    async fn open_position(&mut self, side: Side, price: Decimal, decision: &DecisionResult) {
        let Some(raw_qty) = self.config.order_size_usdt.checked_div(price) else {
            warn!(
                "Order skipped: ${} / {} does not fit a decimal quantity",
                self.config.order_size_usdt, price
            );
            return;
        };
        let quantity = self.execution_handler.normalize_quantity(raw_qty);

        let notional_value = quantity * price;
        if quantity.is_zero() || notional_value < self.config.min_notional {
            warn!(
                "Order skipped: Notional value ${:.2} < ${} (Min limit). Raw Qty: {}, Norm Qty: {}",
                notional_value, self.config.min_notional, raw_qty, quantity
            );
            return;
        }

        match self
            .execution_handler
            .place_order(&self.config.symbol, side, quantity, Some(price))
            .await
        {
            Ok(order) => {
                info!("✅ Order Filled: {:?}", order);
                let position_side = match side {
                    Side::Buy => PositionSide::Long,
                    Side::Sell => PositionSide::Short,
                };
                self.position = Some(Position::open(
                    order.symbol,
                    position_side,
                    order.quantity,
                    order.price,
                ));
                self.entry = decision.state_key.map(|state| EntryMark {
                    state,
                    action: decision.action,
                });
                self.save_state().await;
            }
            Err(e) => {
                error!("⚠️ Execution Error: {:#}", e);
            }
        }
    }

    async fn close_position(
        &mut self,
        pos: Position,
        price: Decimal,
        decision: &DecisionResult,
        cycle: &MarketCycle,
    ) {
        let Some(side) = pos.exit_action().side() else {
            return;
        };

        let order = match self
            .execution_handler
            .place_order(&pos.symbol, side, pos.quantity, Some(price))
            .await
        {
            Ok(order) => order,
            Err(e) => {
                error!("⚠️ Execution Error while closing: {:#}", e);
                return;
            }
        };

        let pnl = pnl_fraction(pos.side, pos.entry_price, order.price);
        let streak_bonus = self.streak.record(pnl);
        self.daily_pnl += realized_pnl(pos.side, pos.entry_price, order.price, order.quantity);
        info!(
            "Closed {:?} {} @ {} (entry {}): PnL {:+.2}%, daily PnL ${}",
            pos.side,
            pos.symbol,
            order.price,
            pos.entry_price,
            pnl * 100.0,
            self.daily_pnl
        );

        match (self.entry.take(), decision.state_key) {
            (Some(entry), Some(exit_state)) => {
                self.strategy.on_trade_closed(&ClosedTrade {
                    entry_state: entry.state,
                    entry_action: entry.action,
                    exit_state,
                    pnl,
                    streak_bonus,
                    context: cycle.context,
                });
            }
            _ => warn!("No entry state recorded for this trade; skipping learning"),
        }

        self.closed_trades += 1;
        if self.config.save_every_trades > 0
            && self.closed_trades % self.config.save_every_trades == 0
        {
            self.checkpoint();
        }

        self.position = None;
        self.save_state().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::paper::PaperExecutor;
    use crate::core::circuit_breaker::CircuitBreakerStatus;
    use crate::rl::StateDiscretizer;
    use crate::types::IndicatorSnapshot;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Plays back a fixed list of actions and records what it learns.
    struct Scripted {
        actions: VecDeque<Action>,
        closed: Arc<Mutex<Vec<ClosedTrade>>>,
        checkpoints: Arc<Mutex<u32>>,
    }

    impl Strategy for Scripted {
        fn name(&self) -> String {
            "scripted".to_string()
        }

        fn init(&mut self) -> Result<()> {
            Ok(())
        }

        fn on_cycle(&mut self, cycle: &MarketCycle, position: Option<&Position>) -> DecisionResult {
            let mut result = DecisionResult::new(CircuitBreakerStatus::Safe);
            result.action = self.actions.pop_front().unwrap_or(Action::Hold);
            result.state_key =
                Some(StateDiscretizer.discretize(&cycle.snapshot, cycle.context.as_ref(), position));
            result
        }

        fn on_trade_closed(&mut self, trade: &ClosedTrade) -> f64 {
            self.closed.lock().unwrap().push(trade.clone());
            0.0
        }

        fn checkpoint(&self) -> Result<()> {
            *self.checkpoints.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn cycle(price: f64) -> MarketCycle {
        cycle_at(price, Utc::now())
    }

    fn cycle_at(price: f64, timestamp: DateTime<Utc>) -> MarketCycle {
        MarketCycle {
            timestamp,
            snapshot: IndicatorSnapshot {
                price,
                ..IndicatorSnapshot::default()
            },
            context: None,
        }
    }

    fn march(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    type Harness = (
        TradingEngine<Scripted>,
        Arc<Mutex<Vec<ClosedTrade>>>,
        Arc<Mutex<u32>>,
        mpsc::Sender<MarketCycle>,
    );

    fn engine(dir: &tempfile::TempDir, actions: &[Action]) -> Harness {
        let closed = Arc::new(Mutex::new(Vec::new()));
        let checkpoints = Arc::new(Mutex::new(0));
        let strategy = Scripted {
            actions: actions.iter().copied().collect(),
            closed: Arc::clone(&closed),
            checkpoints: Arc::clone(&checkpoints),
        };
        let config = EngineConfig {
            state_path: dir.path().join("state.json").display().to_string(),
            save_every_trades: 2,
            ..EngineConfig::default()
        };
        let exec = PaperExecutor::new(Decimal::new(1, 3), Decimal::new(1, 2));
        let (tx, rx) = mpsc::channel(16);
        (
            TradingEngine::new(config, Box::new(exec), strategy, rx),
            closed,
            checkpoints,
            tx,
        )
    }

    #[tokio::test]
    async fn opens_and_closes_a_long() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, closed, _, _tx) = engine(&dir, &[Action::Buy, Action::Hold, Action::Sell]);

        engine.on_cycle(cycle(100.0)).await.unwrap();
        let pos = engine.position().unwrap();
        assert_eq!(pos.side, PositionSide::Long);
        assert_eq!(pos.quantity, Decimal::ONE);

        engine.on_cycle(cycle(102.0)).await.unwrap();
        assert!((engine.position().unwrap().unrealized_pnl - 0.02).abs() < 1e-12);

        engine.on_cycle(cycle(103.0)).await.unwrap();
        assert!(engine.position().is_none());
        assert_eq!(engine.closed_trades(), 1);
        assert_eq!(engine.streak().wins, 1);

        let closed = closed.lock().unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].entry_action, Action::Buy);
        assert!((closed[0].pnl - 0.03).abs() < 1e-12);
    }

    #[tokio::test]
    async fn sell_opens_a_short() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, closed, _, _tx) = engine(&dir, &[Action::Sell, Action::Buy]);

        engine.on_cycle(cycle(100.0)).await.unwrap();
        assert_eq!(engine.position().unwrap().side, PositionSide::Short);

        engine.on_cycle(cycle(95.0)).await.unwrap();
        assert!(engine.position().is_none());
        assert!((closed.lock().unwrap()[0].pnl - 0.05).abs() < 1e-12);
    }

    #[tokio::test]
    async fn unusable_price_skips_the_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _, _, _tx) = engine(&dir, &[Action::Buy]);
        assert!(engine.on_cycle(cycle(f64::NAN)).await.unwrap().is_none());
        assert!(engine.position().is_none());
    }

    #[tokio::test]
    async fn price_below_decimal_precision_skips_the_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _, _, _tx) = engine(&dir, &[Action::Buy]);
        assert!(engine.on_cycle(cycle(1e-29)).await.unwrap().is_none());
        assert!(engine.position().is_none());
    }

    #[tokio::test]
    async fn oversized_quantity_skips_the_order() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _, _, _tx) = engine(&dir, &[Action::Buy]);
        // $100 at 1e-27 is more units than a Decimal holds
        let decision = engine.on_cycle(cycle(1e-27)).await.unwrap().unwrap();
        assert_eq!(decision.action, Action::Buy);
        assert!(engine.position().is_none());
    }

    #[tokio::test]
    async fn dust_orders_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _, _, _tx) = engine(&dir, &[Action::Buy]);
        // $100 buys less than one 0.001 step at this price
        engine.on_cycle(cycle(500_000.0)).await.unwrap();
        assert!(engine.position().is_none());
    }

    #[tokio::test]
    async fn run_checkpoints_and_persists_position() {
        let dir = tempfile::tempdir().unwrap();
        let actions = [
            Action::Buy,
            Action::Sell,
            Action::Buy,
            Action::Sell,
            Action::Buy,
        ];
        let (mut engine, closed, checkpoints, tx) = engine(&dir, &actions);

        for price in [100.0, 99.0, 100.0, 98.5, 100.0] {
            tx.send(cycle(price)).await.unwrap();
        }
        drop(tx);
        engine.run().await.unwrap();

        assert_eq!(closed.lock().unwrap().len(), 2);
        assert_eq!(engine.streak().losses, 2);
        // once after the second trade, once on feed close
        assert_eq!(*checkpoints.lock().unwrap(), 2);

        let (mut restored, _, _, _tx) = engine_from(&dir);
        restored.load_state().await;
        let pos = restored.position().unwrap();
        assert_eq!(pos.side, PositionSide::Long);
        assert_eq!(pos.entry_price, Decimal::from(100));
        assert_eq!(restored.streak().losses, 2);
        assert_eq!(restored.entry.map(|e| e.action), Some(Action::Buy));
    }

    #[tokio::test]
    async fn stop_loss_cuts_a_losing_long_early() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, closed, _, _tx) = engine(&dir, &[Action::Buy, Action::Hold]);

        engine.on_cycle(cycle(100.0)).await.unwrap();
        // -1.5% is inside the early stop at -1.6%
        engine.on_cycle(cycle(98.5)).await.unwrap();
        assert!(engine.position().is_some());

        let decision = engine.on_cycle(cycle(98.0)).await.unwrap().unwrap();
        assert_eq!(decision.action, Action::Sell);
        assert!(decision.reasoning[0].contains("cutting loss early"));
        assert!(decision.state_key.is_some());
        assert!(engine.position().is_none());
        assert!((closed.lock().unwrap()[0].pnl + 0.02).abs() < 1e-12);
        assert_eq!(engine.daily_pnl(), Decimal::from(-2));
    }

    #[tokio::test]
    async fn take_profit_closes_a_winning_short() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, closed, _, _tx) = engine(&dir, &[Action::Sell]);

        engine.on_cycle(cycle(100.0)).await.unwrap();
        let decision = engine.on_cycle(cycle(94.0)).await.unwrap().unwrap();
        assert_eq!(decision.action, Action::Buy);
        assert!(decision.reasoning[0].contains("Take profit target reached"));
        assert!(engine.position().is_none());
        assert!((closed.lock().unwrap()[0].pnl - 0.06).abs() < 1e-12);
        assert_eq!(engine.streak().wins, 1);
    }

    #[tokio::test]
    async fn daily_loss_limit_holds_until_the_next_day() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _, _, _tx) = engine(&dir, &[Action::Buy, Action::Buy]);
        engine.config.starting_balance = Decimal::from(100);

        engine.on_cycle(cycle_at(100.0, march(1, 10))).await.unwrap();
        // stopped out at -$6: 6% of the $100 balance
        engine.on_cycle(cycle_at(94.0, march(1, 11))).await.unwrap();
        assert!(engine.position().is_none());
        assert_eq!(engine.daily_pnl(), Decimal::from(-6));

        let decision = engine
            .on_cycle(cycle_at(100.0, march(1, 12)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.action, Action::Hold);
        assert!(decision.reasoning[0].contains("daily loss limit reached"));
        assert!(engine.position().is_none());

        engine.on_cycle(cycle_at(100.0, march(2, 9))).await.unwrap();
        assert_eq!(engine.daily_pnl(), Decimal::ZERO);
        assert_eq!(engine.position().unwrap().side, PositionSide::Long);
    }

    #[tokio::test]
    async fn daily_loss_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _, _, _tx) = engine(&dir, &[Action::Buy]);
        engine.on_cycle(cycle_at(100.0, march(1, 10))).await.unwrap();
        engine.on_cycle(cycle_at(97.0, march(1, 11))).await.unwrap();

        let (mut restored, _, _, _tx) = engine_from(&dir);
        restored.load_state().await;
        assert_eq!(restored.daily_pnl(), Decimal::from(-3));
        assert_eq!(restored.trading_day, Some(march(1, 0).date_naive()));
    }

    fn engine_from(dir: &tempfile::TempDir) -> Harness {
        engine(dir, &[])
    }
}
