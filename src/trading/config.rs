//! Typed configuration for the DCA strategy, per-account risk limits, and
//! the safety subsystem.

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// How take profit closes the position once the threshold is crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TpMode {
    /// A single crossing closes the entire position.
    #[default]
    Whole,
    /// Up to three sequential partial closes per the split schema.
    Partial,
}

/// A single DCA (margin call) level definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaLevelConfig {
    /// Drop from the previous level's price that arms this level (percent)
    pub drop_percent: Decimal,

    /// Order size multiplier applied to the base order size
    pub multiplier: Decimal,
}

/// DCA strategy configuration for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaConfig {
    /// Base order size in quote currency (USD)
    pub base_order_size: Decimal,

    /// Hard cap on cumulative invested capital across base order + fills
    pub max_investment: Decimal,

    /// Take profit threshold over the average entry (percent)
    pub take_profit_percent: Decimal,

    /// Whole or partial take profit
    pub tp_mode: TpMode,

    /// Partial close percentages; the last step absorbs any residue
    pub partial_tp_schema: Vec<Decimal>,

    /// Stop loss threshold under the average entry (percent)
    pub stop_loss_percent: Decimal,

    /// Attach a trailing stop to every new position
    pub trailing_enabled: bool,

    /// Trail distance of the attached trailing stop (percent)
    pub trailing_callback_percent: Decimal,

    /// Margin call levels, each compounding off the previous trigger price
    pub levels: Vec<DcaLevelConfig>,
}

impl Default for DcaConfig {
    fn default() -> Self {
        Self {
            base_order_size: dec!(10),
            max_investment: dec!(1000),
            take_profit_percent: dec!(1.2),
            tp_mode: TpMode::Whole,
            partial_tp_schema: vec![dec!(30), dec!(30), dec!(40)],
            stop_loss_percent: dec!(3.0),
            trailing_enabled: false,
            trailing_callback_percent: dec!(0.5),
            levels: vec![
                DcaLevelConfig {
                    drop_percent: dec!(1.5),
                    multiplier: dec!(1.0),
                },
                DcaLevelConfig {
                    drop_percent: dec!(2.0),
                    multiplier: dec!(1.5),
                },
                DcaLevelConfig {
                    drop_percent: dec!(3.0),
                    multiplier: dec!(2.0),
                },
            ],
        }
    }
}

impl DcaConfig {
    /// Reject out-of-range values before any position is built from this
    /// config.
    pub fn validate(&self) -> Result<()> {
        if self.base_order_size <= Decimal::ZERO {
            bail!("base_order_size must be positive");
        }
        if self.max_investment < self.base_order_size {
            bail!("max_investment must cover at least the base order");
        }
        if self.take_profit_percent <= Decimal::ZERO {
            bail!("take_profit_percent must be positive");
        }
        if self.stop_loss_percent <= Decimal::ZERO {
            bail!("stop_loss_percent must be positive");
        }
        if self.trailing_enabled && self.trailing_callback_percent <= Decimal::ZERO {
            bail!("trailing_callback_percent must be positive when trailing is enabled");
        }
        if self.partial_tp_schema.is_empty() {
            bail!("partial_tp_schema must have at least one step");
        }
        let schema_total: Decimal = self.partial_tp_schema.iter().sum();
        if schema_total != dec!(100) {
            bail!("partial_tp_schema must sum to 100, got {schema_total}");
        }
        for (i, level) in self.levels.iter().enumerate() {
            if level.drop_percent <= Decimal::ZERO || level.drop_percent >= dec!(100) {
                bail!("level {} drop_percent out of range", i + 1);
            }
            if level.multiplier <= Decimal::ZERO {
                bail!("level {} multiplier must be positive", i + 1);
            }
        }
        Ok(())
    }
}

/// Per-account risk limits enforced by the orchestrator pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Maximum leverage; requests above this are capped, not rejected
    pub leverage_cap: u32,

    /// Maximum concurrently open positions
    pub max_concurrent_positions: usize,

    /// Daily cap on opened trades
    pub max_daily_trades: u32,

    /// Daily realized-loss limit as percent of account balance
    pub max_daily_loss_percent: Decimal,

    /// Minimum order size in quote currency
    pub min_order_size: Decimal,

    /// Maximum order size in quote currency
    pub max_order_size: Decimal,

    /// Balance assumed when the exchange balance call fails
    pub fallback_balance: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            leverage_cap: 20,
            max_concurrent_positions: 10,
            max_daily_trades: 20,
            max_daily_loss_percent: dec!(5.0),
            min_order_size: dec!(5.0),
            max_order_size: dec!(10000.0),
            fallback_balance: dec!(1000.0),
        }
    }
}

/// Circuit breaker and idempotency settings for the safety manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Windowed loss threshold as percent of account balance
    pub max_loss_percent: Decimal,

    /// Consecutive losing trades before the breaker trips
    pub max_consecutive_losses: u32,

    /// Sliding window for loss accumulation (minutes)
    pub lookback_minutes: i64,

    /// Disables circuit-breaker bookkeeping entirely when false
    pub enabled: bool,

    /// Idempotency keys older than this are pruned (hours)
    pub idempotency_ttl_hours: i64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_loss_percent: dec!(10.0),
            max_consecutive_losses: 5,
            lookback_minutes: 60,
            enabled: true,
            idempotency_ttl_hours: 24,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(DcaConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_schema_not_summing_to_100() {
        let config = DcaConfig {
            partial_tp_schema: vec![dec!(50), dec!(30)],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_cap_below_base_order() {
        let config = DcaConfig {
            base_order_size: dec!(100),
            max_investment: dec!(50),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
