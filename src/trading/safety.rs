//! Safety rails: kill switch, circuit breaker, trading pause, order
//! idempotency, and static boundary validators.
//!
//! The kill switch and circuit breaker are independent gates; either alone
//! blocks new execution. The pause auto-expires; the circuit breaker never
//! does and requires manual deactivation.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

use super::config::SafetyConfig;

/// Outcome of a safety or validation check.
#[derive(Debug, Clone)]
pub struct SafetyVerdict {
    pub allowed: bool,
    pub reason: String,
}

impl SafetyVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: "ok".to_string(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// One entry of the sliding trade-outcome window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub timestamp: DateTime<Utc>,
    pub pnl: Decimal,
}

/// Global trading gate. Serializable so the whole state survives restarts
/// as a single snapshot row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyManager {
    config: SafetyConfig,

    kill_switch_active: bool,
    kill_switch_reason: String,
    kill_switch_activated_at: Option<DateTime<Utc>>,

    circuit_breaker_active: bool,
    circuit_breaker_reason: String,

    trading_paused: bool,
    pause_until: Option<DateTime<Utc>>,

    recent_trades: Vec<TradeOutcome>,
    consecutive_losses: u32,

    /// Idempotency keys seen, with creation time for lazy pruning
    seen_orders: HashMap<String, DateTime<Utc>>,
}

impl SafetyManager {
    pub fn new(config: SafetyConfig) -> Self {
        Self {
            config,
            kill_switch_active: false,
            kill_switch_reason: String::new(),
            kill_switch_activated_at: None,
            circuit_breaker_active: false,
            circuit_breaker_reason: String::new(),
            trading_paused: false,
            pause_until: None,
            recent_trades: Vec::new(),
            consecutive_losses: 0,
            seen_orders: HashMap::new(),
        }
    }

    // ==================== Trading gate ====================

    /// Check whether new execution may start. Expired pauses auto-resume
    /// here.
    pub fn trading_allowed(&mut self) -> SafetyVerdict {
        if self.kill_switch_active {
            return SafetyVerdict::deny(format!(
                "kill switch active: {}",
                self.kill_switch_reason
            ));
        }

        if self.circuit_breaker_active {
            return SafetyVerdict::deny(format!(
                "circuit breaker active: {}",
                self.circuit_breaker_reason
            ));
        }

        if self.trading_paused {
            match self.pause_until {
                Some(until) if Utc::now() < until => {
                    return SafetyVerdict::deny(format!("trading paused until {until}"));
                }
                _ => {
                    self.trading_paused = false;
                    self.pause_until = None;
                    info!("trading pause expired, resuming");
                }
            }
        }

        SafetyVerdict::allow()
    }

    // ==================== Kill switch ====================

    pub fn activate_kill_switch(&mut self, reason: impl Into<String>) {
        self.kill_switch_active = true;
        self.kill_switch_reason = reason.into();
        self.kill_switch_activated_at = Some(Utc::now());
        warn!(reason = %self.kill_switch_reason, "KILL SWITCH ACTIVATED");
    }

    pub fn deactivate_kill_switch(&mut self) {
        if !self.kill_switch_active {
            return;
        }
        self.kill_switch_active = false;
        self.kill_switch_reason.clear();
        self.kill_switch_activated_at = None;
        info!("kill switch deactivated, trading resumed");
    }

    // ==================== Circuit breaker ====================

    pub fn activate_circuit_breaker(&mut self, reason: impl Into<String>) {
        self.circuit_breaker_active = true;
        self.circuit_breaker_reason = reason.into();
        warn!(reason = %self.circuit_breaker_reason, "CIRCUIT BREAKER ACTIVATED");
    }

    /// Manual reset. The breaker never clears itself.
    pub fn deactivate_circuit_breaker(&mut self) {
        self.circuit_breaker_active = false;
        self.circuit_breaker_reason.clear();
        info!("circuit breaker deactivated");
    }

    // ==================== Pause ====================

    pub fn pause_trading(&mut self, duration: Duration, reason: &str) {
        let until = Utc::now() + duration;
        self.trading_paused = true;
        self.pause_until = Some(until);
        info!(until = %until, reason, "trading paused");
    }

    pub fn resume_trading(&mut self) {
        self.trading_paused = false;
        self.pause_until = None;
        info!("trading resumed");
    }

    // ==================== Trade outcomes ====================

    /// Record a realized trade result and trip the circuit breaker when
    /// either the windowed loss or the consecutive-loss streak breaches its
    /// threshold.
    pub fn record_trade_result(&mut self, pnl: Decimal, account_balance: Decimal) {
        if !self.config.enabled {
            return;
        }

        self.recent_trades.push(TradeOutcome {
            timestamp: Utc::now(),
            pnl,
        });

        let cutoff = Utc::now() - Duration::minutes(self.config.lookback_minutes);
        self.recent_trades.retain(|t| t.timestamp > cutoff);

        if pnl < Decimal::ZERO {
            self.consecutive_losses += 1;
        } else {
            self.consecutive_losses = 0;
        }

        self.check_circuit_breaker_triggers(account_balance);
    }

    fn check_circuit_breaker_triggers(&mut self, account_balance: Decimal) {
        if self.circuit_breaker_active {
            return;
        }

        let windowed_pnl: Decimal = self.recent_trades.iter().map(|t| t.pnl).sum();
        if windowed_pnl < Decimal::ZERO && account_balance > Decimal::ZERO {
            let loss_pct = windowed_pnl.abs() / account_balance * Decimal::ONE_HUNDRED;
            if loss_pct >= self.config.max_loss_percent {
                self.activate_circuit_breaker(format!(
                    "windowed loss {loss_pct:.2}% exceeds {}% threshold",
                    self.config.max_loss_percent
                ));
                return;
            }
        }

        if self.consecutive_losses >= self.config.max_consecutive_losses {
            self.activate_circuit_breaker(format!(
                "{} consecutive losses (max: {})",
                self.consecutive_losses, self.config.max_consecutive_losses
            ));
        }
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    // ==================== Order idempotency ====================

    /// Returns true when the key is new (safe to place) and records it;
    /// false when the same key was seen within the TTL. Expired keys are
    /// pruned lazily on each check.
    pub fn check_order_idempotency(&mut self, key: &str) -> bool {
        let cutoff = Utc::now() - Duration::hours(self.config.idempotency_ttl_hours);
        self.seen_orders.retain(|_, created| *created > cutoff);

        if self.seen_orders.contains_key(key) {
            warn!(key, "duplicate order detected");
            return false;
        }

        self.seen_orders.insert(key.to_string(), Utc::now());
        true
    }

    pub fn tracked_orders(&self) -> usize {
        self.seen_orders.len()
    }

    // ==================== Static validators ====================

    /// Denylist wins over allowlist; an absent allowlist permits everything.
    pub fn validate_symbol(
        &self,
        symbol: &str,
        allowlist: Option<&[String]>,
        denylist: &[String],
    ) -> SafetyVerdict {
        if denylist.iter().any(|s| s == symbol) {
            return SafetyVerdict::deny(format!("symbol {symbol} is denylisted"));
        }
        if let Some(allowed) = allowlist {
            if !allowed.iter().any(|s| s == symbol) {
                return SafetyVerdict::deny(format!("symbol {symbol} not in allowlist"));
            }
        }
        SafetyVerdict::allow()
    }

    pub fn validate_leverage(&self, leverage: u32, max_leverage: u32) -> SafetyVerdict {
        if leverage < 1 {
            return SafetyVerdict::deny("leverage must be at least 1x");
        }
        if leverage > max_leverage {
            return SafetyVerdict::deny(format!(
                "leverage {leverage}x exceeds maximum {max_leverage}x"
            ));
        }
        SafetyVerdict::allow()
    }

    pub fn validate_order_size(
        &self,
        order_size: Decimal,
        min_size: Decimal,
        max_size: Decimal,
    ) -> SafetyVerdict {
        if order_size < min_size {
            return SafetyVerdict::deny(format!(
                "order size ${order_size} below minimum ${min_size}"
            ));
        }
        if order_size > max_size {
            return SafetyVerdict::deny(format!(
                "order size ${order_size} exceeds maximum ${max_size}"
            ));
        }
        SafetyVerdict::allow()
    }

    // ==================== Status ====================

    /// Human-readable snapshot for the status command.
    pub fn status_summary(&mut self) -> String {
        let verdict = self.trading_allowed();
        format!(
            "trading_allowed={} reason={} kill_switch={} circuit_breaker={} paused={} consecutive_losses={} tracked_orders={}",
            verdict.allowed,
            verdict.reason,
            self.kill_switch_active,
            self.circuit_breaker_active,
            self.trading_paused,
            self.consecutive_losses,
            self.seen_orders.len(),
        )
    }
}

impl Default for SafetyManager {
    fn default() -> Self {
        Self::new(SafetyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn kill_switch_blocks_and_releases() {
        let mut safety = SafetyManager::default();
        assert!(safety.trading_allowed().allowed);

        safety.activate_kill_switch("manual halt");
        let verdict = safety.trading_allowed();
        assert!(!verdict.allowed);
        assert!(verdict.reason.contains("kill switch"));

        safety.deactivate_kill_switch();
        assert!(safety.trading_allowed().allowed);
    }

    #[test]
    fn kill_switch_and_breaker_are_independent() {
        let mut safety = SafetyManager::default();
        safety.activate_circuit_breaker("test");
        safety.activate_kill_switch("test");

        safety.deactivate_kill_switch();
        let verdict = safety.trading_allowed();
        assert!(!verdict.allowed);
        assert!(verdict.reason.contains("circuit breaker"));
    }

    #[test]
    fn consecutive_losses_trip_the_breaker() {
        let mut safety = SafetyManager::default();

        for _ in 0..4 {
            safety.record_trade_result(dec!(-10), dec!(10000));
            assert!(safety.trading_allowed().allowed);
        }

        safety.record_trade_result(dec!(-10), dec!(10000));
        let verdict = safety.trading_allowed();
        assert!(!verdict.allowed);
        assert!(verdict.reason.contains("circuit breaker"));
    }

    #[test]
    fn a_win_resets_the_loss_streak() {
        let mut safety = SafetyManager::default();

        for _ in 0..4 {
            safety.record_trade_result(dec!(-10), dec!(10000));
        }
        safety.record_trade_result(dec!(5), dec!(10000));
        assert_eq!(safety.consecutive_losses(), 0);

        safety.record_trade_result(dec!(-10), dec!(10000));
        assert!(safety.trading_allowed().allowed);
    }

    #[test]
    fn windowed_loss_percent_trips_the_breaker() {
        let mut safety = SafetyManager::default();

        // 10% of 1000 = 100; three -40 trades breach it.
        safety.record_trade_result(dec!(-40), dec!(1000));
        safety.record_trade_result(dec!(-40), dec!(1000));
        assert!(safety.trading_allowed().allowed);

        safety.record_trade_result(dec!(-40), dec!(1000));
        assert!(!safety.trading_allowed().allowed);
    }

    #[test]
    fn breaker_requires_manual_reset() {
        let mut safety = SafetyManager::default();
        safety.activate_circuit_breaker("losses");

        // Winning trades do not clear it.
        safety.record_trade_result(dec!(100), dec!(10000));
        assert!(!safety.trading_allowed().allowed);

        safety.deactivate_circuit_breaker();
        assert!(safety.trading_allowed().allowed);
    }

    #[test]
    fn pause_auto_expires() {
        let mut safety = SafetyManager::default();
        safety.pause_trading(Duration::minutes(-1), "already past");
        assert!(safety.trading_allowed().allowed);

        safety.pause_trading(Duration::minutes(30), "cooldown");
        assert!(!safety.trading_allowed().allowed);
        safety.resume_trading();
        assert!(safety.trading_allowed().allowed);
    }

    #[test]
    fn duplicate_keys_rejected_within_ttl() {
        let mut safety = SafetyManager::default();

        assert!(safety.check_order_idempotency("BTCUSDT_abc123"));
        assert!(!safety.check_order_idempotency("BTCUSDT_abc123"));
        assert!(safety.check_order_idempotency("BTCUSDT_def456"));
        assert_eq!(safety.tracked_orders(), 2);
    }

    #[test]
    fn symbol_denylist_wins_over_allowlist() {
        let safety = SafetyManager::default();
        let allow = vec!["BTCUSDT".to_string()];
        let deny = vec!["BTCUSDT".to_string()];

        assert!(!safety
            .validate_symbol("BTCUSDT", Some(&allow), &deny)
            .allowed);
        assert!(safety.validate_symbol("BTCUSDT", Some(&allow), &[]).allowed);
        assert!(!safety.validate_symbol("DOGEUSDT", Some(&allow), &[]).allowed);
        assert!(safety.validate_symbol("DOGEUSDT", None, &[]).allowed);
    }

    #[test]
    fn leverage_and_order_size_bounds() {
        let safety = SafetyManager::default();

        assert!(!safety.validate_leverage(0, 20).allowed);
        assert!(safety.validate_leverage(20, 20).allowed);
        assert!(!safety.validate_leverage(21, 20).allowed);

        assert!(!safety
            .validate_order_size(dec!(1), dec!(5), dec!(10000))
            .allowed);
        assert!(safety
            .validate_order_size(dec!(10), dec!(5), dec!(10000))
            .allowed);
        assert!(!safety
            .validate_order_size(dec!(20000), dec!(5), dec!(10000))
            .allowed);
    }
}
