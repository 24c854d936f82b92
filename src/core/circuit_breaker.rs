// src/core/circuit_breaker.rs
//! Capital-protection state machine shared by the market guardian and the
//! decision loop.
//!
//! SAFE → WARNING (informational) → TRIGGERED (vetoes trading) → RECOVERING
//! (still vetoes) → SAFE. Every transition and every full-state read goes
//! through one mutex, so readers never see a half-applied transition.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CircuitBreakerStatus {
    #[default]
    Safe,
    Warning,
    Triggered,
    Recovering,
}

impl fmt::Display for CircuitBreakerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitBreakerStatus::Safe => "SAFE",
            CircuitBreakerStatus::Warning => "WARNING",
            CircuitBreakerStatus::Triggered => "TRIGGERED",
            CircuitBreakerStatus::Recovering => "RECOVERING",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub status: CircuitBreakerStatus,
    pub triggered_at: Option<DateTime<Utc>>,
    pub trigger_reason: Option<String>,
    pub trigger_details: Value,
    pub market_snapshot: Value,
    pub recovery_started_at: Option<DateTime<Utc>>,
    pub last_check_at: Option<DateTime<Utc>>,
    /// Downtime of the most recent trigger→clear cycle.
    pub last_downtime_secs: u64,
    pub total_downtime_secs: u64,
    pub total_triggers: u64,
    pub false_triggers: u64,
    pub capital_saved: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub total_triggers: u64,
    pub false_triggers: u64,
    pub total_downtime_secs: u64,
    pub capital_saved: Decimal,
    pub last_check_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct CircuitBreaker {
    state: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerState> {
        // a panicking holder cannot leave a half-written transition behind:
        // every transition assigns its fields before returning
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        self.lock().status
    }

    pub fn is_safe(&self) -> bool {
        self.status() == CircuitBreakerStatus::Safe
    }

    /// TRIGGERED or RECOVERING.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status(),
            CircuitBreakerStatus::Triggered | CircuitBreakerStatus::Recovering
        )
    }

    /// Consistent copy of the whole state.
    pub fn snapshot(&self) -> CircuitBreakerState {
        self.lock().clone()
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.lock();
        CircuitBreakerStats {
            total_triggers: state.total_triggers,
            false_triggers: state.false_triggers,
            total_downtime_secs: state.total_downtime_secs,
            capital_saved: state.capital_saved,
            last_check_at: state.last_check_at,
        }
    }

    pub fn trigger(&self, reason: &str, details: Value, market_snapshot: Option<Value>) -> bool {
        self.trigger_at(reason, details, market_snapshot, Utc::now())
    }

    /// Moves to TRIGGERED. Returns `false` and changes nothing when already TRIGGERED.
    pub fn trigger_at(
        &self,
        reason: &str,
        details: Value,
        market_snapshot: Option<Value>,
        at: DateTime<Utc>,
    ) -> bool {
        let mut state = self.lock();
        if state.status == CircuitBreakerStatus::Triggered {
            return false;
        }

        state.status = CircuitBreakerStatus::Triggered;
        state.triggered_at = Some(at);
        state.trigger_reason = Some(reason.to_string());
        state.trigger_details = details;
        state.market_snapshot = market_snapshot.unwrap_or(Value::Null);
        state.recovery_started_at = None;
        state.total_triggers += 1;

        warn!("🚨 CIRCUIT BREAKER TRIGGERED: {}", reason);
        true
    }

    pub fn set_warning(&self, reason: &str, details: Value) -> bool {
        self.set_warning_at(reason, details, Utc::now())
    }

    /// SAFE → WARNING. Never overrides WARNING and never escalates past it.
    pub fn set_warning_at(&self, reason: &str, details: Value, at: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        if state.status != CircuitBreakerStatus::Safe {
            return false;
        }

        state.status = CircuitBreakerStatus::Warning;
        state.trigger_reason = Some(reason.to_string());
        state.trigger_details = details;
        state.last_check_at = Some(at);

        warn!("⚠️ CIRCUIT BREAKER WARNING: {}", reason);
        true
    }

    /// WARNING → SAFE once conditions normalize. Counters are untouched.
    pub fn clear_warning(&self) -> bool {
        let mut state = self.lock();
        if state.status != CircuitBreakerStatus::Warning {
            return false;
        }

        state.status = CircuitBreakerStatus::Safe;
        state.trigger_reason = None;
        state.trigger_details = Value::Null;

        info!("Circuit breaker warning cleared");
        true
    }

    pub fn start_recovery(&self) -> bool {
        self.start_recovery_at(Utc::now())
    }

    /// TRIGGERED → RECOVERING.
    pub fn start_recovery_at(&self, at: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        if state.status != CircuitBreakerStatus::Triggered {
            return false;
        }

        state.status = CircuitBreakerStatus::Recovering;
        state.recovery_started_at = Some(at);

        info!("🔄 Circuit breaker: starting recovery");
        true
    }

    /// Returns the downtime of this cycle in seconds.
    pub fn clear(&self, capital_saved: Decimal) -> u64 {
        self.clear_at(capital_saved, Utc::now())
    }

    /// Back to SAFE from any status. Downtime is measured from the trigger
    /// time (0 if never triggered) and added to the running totals.
    pub fn clear_at(&self, capital_saved: Decimal, at: DateTime<Utc>) -> u64 {
        let mut state = self.lock();

        let downtime = state
            .triggered_at
            .map(|t| (at - t).num_seconds().max(0) as u64)
            .unwrap_or(0);

        state.status = CircuitBreakerStatus::Safe;
        state.last_downtime_secs = downtime;
        state.total_downtime_secs += downtime;
        state.capital_saved += capital_saved;
        state.triggered_at = None;
        state.trigger_reason = None;
        state.trigger_details = Value::Null;
        state.market_snapshot = Value::Null;
        state.recovery_started_at = None;
        state.last_check_at = Some(at);

        info!(
            "✅ Circuit breaker cleared. Downtime: {}s. Capital saved: ${}",
            downtime, capital_saved
        );
        downtime
    }

    pub fn mark_false_trigger(&self) {
        self.lock().false_triggers += 1;
    }

    /// Records that the monitor has looked at the market.
    pub fn touch(&self, at: DateTime<Utc>) {
        self.lock().last_check_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;

    fn crash_details() -> Value {
        json!({
            "btc_price_from": 50850,
            "btc_price_to": 42150,
            "drop_percent": 17.3,
            "timeframe_minutes": 52
        })
    }

    #[test]
    fn starts_safe() {
        let cb = CircuitBreaker::new();
        assert!(cb.is_safe());
        assert!(!cb.is_active());
        assert_eq!(cb.snapshot(), CircuitBreakerState::default());
    }

    #[test]
    fn second_trigger_is_a_no_op() {
        let cb = CircuitBreaker::new();
        assert!(cb.trigger("BTC dropped 17% in 52min", crash_details(), None));
        assert!(!cb.trigger("BTC dropped 19% in 55min", json!({}), None));

        let state = cb.snapshot();
        assert_eq!(state.total_triggers, 1);
        assert_eq!(state.trigger_reason.as_deref(), Some("BTC dropped 17% in 52min"));
        assert_eq!(state.trigger_details["drop_percent"], json!(17.3));
        assert!(cb.is_active());
    }

    #[test]
    fn clear_without_trigger_has_no_downtime() {
        let cb = CircuitBreaker::new();
        assert_eq!(cb.clear(Decimal::ZERO), 0);
        let stats = cb.stats();
        assert_eq!(stats.total_downtime_secs, 0);
        assert_eq!(stats.total_triggers, 0);
        assert!(cb.is_safe());
    }

    #[test]
    fn warning_only_from_safe() {
        let cb = CircuitBreaker::new();
        assert!(cb.set_warning("BTC down 12%", json!({"drop_percent": 12.0})));
        assert!(!cb.set_warning("BTC down 13%", json!({})));
        assert_eq!(cb.status(), CircuitBreakerStatus::Warning);
        assert!(!cb.is_active());
        assert!(!cb.start_recovery());

        assert!(cb.trigger("BTC down 16%", json!({}), None));
        assert!(!cb.set_warning("late warning", json!({})));
        assert!(!cb.clear_warning());
        assert_eq!(cb.status(), CircuitBreakerStatus::Triggered);
    }

    #[test]
    fn warning_clears_back_to_safe() {
        let cb = CircuitBreaker::new();
        assert!(!cb.clear_warning());
        cb.set_warning("ETH down 11%", json!({}));
        assert!(cb.clear_warning());
        let state = cb.snapshot();
        assert_eq!(state.status, CircuitBreakerStatus::Safe);
        assert_eq!(state.trigger_reason, None);
        assert_eq!(state.total_triggers, 0);
    }

    #[test]
    fn full_cycle_accumulates_downtime_and_capital() {
        let cb = CircuitBreaker::new();
        let t0 = Utc::now();
        let snapshot = json!({"btc_price": 42150, "eth_price": 2240});

        assert!(cb.trigger_at("BTC crash", crash_details(), Some(snapshot.clone()), t0));
        assert_eq!(cb.snapshot().market_snapshot, snapshot);
        assert!(cb.start_recovery_at(t0 + Duration::minutes(30)));
        assert!(!cb.start_recovery_at(t0 + Duration::minutes(31)));
        assert_eq!(cb.status(), CircuitBreakerStatus::Recovering);
        assert!(cb.is_active());

        let downtime = cb.clear_at(Decimal::from(4810), t0 + Duration::minutes(90));
        assert_eq!(downtime, 5400);

        assert!(cb.trigger_at("ETH crash", json!({}), None, t0 + Duration::hours(5)));
        cb.clear_at(Decimal::from(190), t0 + Duration::hours(5) + Duration::seconds(600));

        let state = cb.snapshot();
        assert_eq!(state.status, CircuitBreakerStatus::Safe);
        assert_eq!(state.triggered_at, None);
        assert_eq!(state.recovery_started_at, None);
        assert_eq!(state.market_snapshot, Value::Null);
        assert_eq!(state.last_downtime_secs, 600);
        assert_eq!(state.total_downtime_secs, 6000);
        assert_eq!(state.total_triggers, 2);
        assert_eq!(state.capital_saved, Decimal::from(5000));
    }

    #[test]
    fn recovering_can_be_retriggered() {
        let cb = CircuitBreaker::new();
        cb.trigger("first", json!({}), None);
        cb.start_recovery();
        assert!(cb.trigger("aftershock", json!({}), None));
        let state = cb.snapshot();
        assert_eq!(state.status, CircuitBreakerStatus::Triggered);
        assert_eq!(state.recovery_started_at, None);
        assert_eq!(state.total_triggers, 2);
    }

    #[test]
    fn false_triggers_are_counted() {
        let cb = CircuitBreaker::new();
        cb.trigger("glitch", json!({}), None);
        cb.clear(Decimal::ZERO);
        cb.mark_false_trigger();
        assert_eq!(cb.stats().false_triggers, 1);
    }

    #[test]
    fn concurrent_triggers_count_once() {
        let cb = Arc::new(CircuitBreaker::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cb = Arc::clone(&cb);
                thread::spawn(move || cb.trigger(&format!("monitor {}", i), json!({}), None))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(cb.stats().total_triggers, 1);
    }

    #[test]
    fn readers_never_see_partial_transitions() {
        let cb = Arc::new(CircuitBreaker::new());
        let writer = {
            let cb = Arc::clone(&cb);
            thread::spawn(move || {
                for _ in 0..500 {
                    cb.trigger("crash", json!({"n": 1}), None);
                    cb.start_recovery();
                    cb.clear(Decimal::ZERO);
                }
            })
        };
        let reader = {
            let cb = Arc::clone(&cb);
            thread::spawn(move || {
                for _ in 0..2_000 {
                    let s = cb.snapshot();
                    assert_eq!(s.triggered_at.is_some(), s.trigger_reason.is_some());
                    if s.status == CircuitBreakerStatus::Recovering {
                        assert!(s.recovery_started_at.is_some());
                    }
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(cb.stats().total_triggers, 500);
    }
}
