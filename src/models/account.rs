//! Account profiles: per-owner risk and strategy settings plus daily
//! trading stats.

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::trading::config::{DcaConfig, RiskConfig};

/// Daily counters, reset on the first touch of a new UTC day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub trades_count: u32,
    pub realized_pnl: Decimal,
}

impl Default for DailyStats {
    fn default() -> Self {
        Self {
            date: Utc::now().date_naive(),
            trades_count: 0,
            realized_pnl: Decimal::ZERO,
        }
    }
}

/// Per-owner configuration and state the orchestrator consults before and
/// after every execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountProfile {
    pub owner_id: String,

    /// DCA strategy enabled for this owner
    pub strategy_enabled: bool,

    /// An exchange account is present and enabled
    pub exchange_enabled: bool,

    /// Close this owner's positions when a cancellation signal arrives
    pub auto_stop_enabled: bool,

    /// When set, only these symbols may trade
    pub symbol_allowlist: Option<Vec<String>>,

    /// Symbols that may never trade; checked before the allowlist
    pub symbol_denylist: Vec<String>,

    pub risk: RiskConfig,
    pub dca: DcaConfig,

    pub daily: DailyStats,
}

impl AccountProfile {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            strategy_enabled: true,
            exchange_enabled: true,
            auto_stop_enabled: true,
            symbol_allowlist: None,
            symbol_denylist: Vec::new(),
            risk: RiskConfig::default(),
            dca: DcaConfig::default(),
            daily: DailyStats::default(),
        }
    }

    fn roll_daily_if_needed(&mut self) {
        let today = Utc::now().date_naive();
        if self.daily.date != today {
            self.daily = DailyStats {
                date: today,
                ..Default::default()
            };
        }
    }

    /// Cap requested leverage to this account's maximum.
    pub fn capped_leverage(&self, requested: u32) -> u32 {
        requested.min(self.risk.leverage_cap)
    }

    /// Daily trade-count and daily-loss-percent gates.
    pub fn can_trade_today(&mut self, account_balance: Decimal) -> bool {
        self.roll_daily_if_needed();

        if self.daily.trades_count >= self.risk.max_daily_trades {
            return false;
        }

        if self.daily.realized_pnl < Decimal::ZERO && account_balance > Decimal::ZERO {
            let loss_pct =
                self.daily.realized_pnl.abs() / account_balance * Decimal::ONE_HUNDRED;
            if loss_pct >= self.risk.max_daily_loss_percent {
                return false;
            }
        }

        true
    }

    /// Count an opened trade against today's cap.
    pub fn record_open(&mut self) {
        self.roll_daily_if_needed();
        self.daily.trades_count += 1;
    }

    /// Fold a realized close into today's PnL.
    pub fn record_close(&mut self, pnl: Decimal) {
        self.roll_daily_if_needed();
        self.daily.realized_pnl += pnl;
    }
}

/// In-memory registry of account profiles. User management proper lives
/// outside the engine; the orchestrator only needs lookups and daily-stat
/// updates.
#[derive(Debug, Default)]
pub struct AccountRegistry {
    accounts: HashMap<String, AccountProfile>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a single default account, for single-operator runs.
    pub fn with_default_account() -> Self {
        let mut registry = Self::new();
        registry.insert(AccountProfile::new("default"));
        registry
    }

    pub fn insert(&mut self, profile: AccountProfile) {
        self.accounts.insert(profile.owner_id.clone(), profile);
    }

    pub fn get(&self, owner_id: &str) -> Option<&AccountProfile> {
        self.accounts.get(owner_id)
    }

    pub fn get_mut(&mut self, owner_id: &str) -> Option<&mut AccountProfile> {
        self.accounts.get_mut(owner_id)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn leverage_is_capped_not_rejected() {
        let profile = AccountProfile::new("user-1");
        assert_eq!(profile.capped_leverage(50), 20);
        assert_eq!(profile.capped_leverage(5), 5);
    }

    #[test]
    fn daily_trade_cap_blocks_further_trades() {
        let mut profile = AccountProfile::new("user-1");
        profile.risk.max_daily_trades = 2;

        assert!(profile.can_trade_today(dec!(1000)));
        profile.record_open();
        profile.record_open();
        assert!(!profile.can_trade_today(dec!(1000)));
    }

    #[test]
    fn daily_loss_percent_blocks_trading() {
        let mut profile = AccountProfile::new("user-1");
        // 5% of 1000 = 50; a 60 loss breaches the limit.
        profile.record_close(dec!(-60));
        assert!(!profile.can_trade_today(dec!(1000)));

        // A larger account absorbs the same loss.
        assert!(profile.can_trade_today(dec!(10000)));
    }
}
