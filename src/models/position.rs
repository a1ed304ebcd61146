//! Position model: the per-position DCA state machine.
//!
//! A position is born from a confirmed base-order fill, scales in through
//! margin-call levels that compound off the previous level's trigger price,
//! and exits through whole/partial take profit, stop loss (with breakeven
//! promotion), progressive targets, or an external close.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::trading::config::{DcaConfig, TpMode};

/// Direction of a leveraged position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LONG" | "BUY" => Some(PositionSide::Long),
            "SHORT" | "SELL" => Some(PositionSide::Short),
            _ => None,
        }
    }
}

/// Position lifecycle. No transitions leave a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Active,
    PartiallyClosed,
    TpClosed,
    SlClosed,
    Cancelled,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Active => "ACTIVE",
            PositionStatus::PartiallyClosed => "PARTIALLY_CLOSED",
            PositionStatus::TpClosed => "TP_CLOSED",
            PositionStatus::SlClosed => "SL_CLOSED",
            PositionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(PositionStatus::Active),
            "PARTIALLY_CLOSED" => Some(PositionStatus::PartiallyClosed),
            "TP_CLOSED" => Some(PositionStatus::TpClosed),
            "SL_CLOSED" => Some(PositionStatus::SlClosed),
            "CANCELLED" => Some(PositionStatus::Cancelled),
            _ => None,
        }
    }

    /// Open for further fills and exits.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            PositionStatus::Active | PositionStatus::PartiallyClosed
        )
    }
}

/// Fill state of a single DCA level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DcaLevelStatus {
    Pending,
    Triggered,
    Filled,
}

/// One margin-call level of a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaLevel {
    /// 1-based ordinal
    pub index: u32,

    /// Price at which this level arms, derived from the previous level
    pub trigger_price: Decimal,

    /// Order size in quote currency
    pub order_size: Decimal,

    /// Multiplier applied to the base order size
    pub multiplier: Decimal,

    pub status: DcaLevelStatus,

    pub filled_price: Option<Decimal>,
    pub filled_qty: Option<Decimal>,
    pub filled_at: Option<DateTime<Utc>>,
}

/// A progressive take-profit target from the originating signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeProfitTarget {
    /// 1-based ordinal
    pub index: u32,
    pub price: Decimal,
    pub hit: bool,
    pub hit_at: Option<DateTime<Utc>>,
}

/// Which take-profit path fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpHit {
    /// Close the entire remaining position.
    Whole,
    /// Close the next step of the partial schema (0-based).
    Partial { step: usize },
}

/// Result of closing some or all of a position.
#[derive(Debug, Clone)]
pub struct CloseOutcome {
    pub closed_qty: Decimal,
    pub exit_price: Decimal,
    pub avg_entry: Decimal,
    pub pnl: Decimal,
    /// True when this close promoted the stop loss to breakeven
    pub breakeven_promoted: bool,
    /// True when nothing remains and the position reached a terminal state
    pub fully_closed: bool,
}

/// A leveraged DCA position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub owner_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub leverage: u32,

    /// Base order size in quote currency
    pub base_order_size: Decimal,

    /// Original entry price of the base order
    pub entry_price: Decimal,

    /// Cumulative filled quantity (base order + DCA fills); never reduced
    pub total_filled_qty: Decimal,

    /// Quantity still open; reduced by every close
    pub remaining_qty: Decimal,

    /// Cumulative cost of all fills, for the weighted average entry
    pub total_cost: Decimal,

    /// Cumulative invested capital in quote currency
    pub total_invested: Decimal,

    /// Weighted average entry price, recomputed on every fill
    pub avg_entry: Decimal,

    /// Investment cap that bounds level generation
    pub max_investment: Decimal,

    /// Realized profit accumulated across all closes
    pub realized_pnl: Decimal,

    pub dca_levels: Vec<DcaLevel>,
    pub targets: Vec<TakeProfitTarget>,

    pub take_profit_percent: Decimal,
    pub tp_mode: TpMode,
    pub partial_tp_schema: Vec<Decimal>,
    /// Completed partial take-profit steps
    pub partial_tp_hits: usize,

    pub stop_loss_percent: Decimal,
    /// Explicit stop price from the signal, overriding the percent until
    /// breakeven promotion
    pub stop_loss_price: Option<Decimal>,
    /// One-way ratchet: set by the first partial take profit, never cleared
    pub breakeven_sl: bool,

    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Open a position from a confirmed base-order fill.
    ///
    /// The base order is recorded as the first fill and DCA levels are
    /// generated compounding off each previous trigger. Level generation
    /// halts silently once the projected investment would exceed the cap.
    pub fn open(
        owner_id: impl Into<String>,
        symbol: impl Into<String>,
        side: PositionSide,
        entry_price: Decimal,
        leverage: u32,
        config: &DcaConfig,
        targets: &[Decimal],
        stop_loss_price: Option<Decimal>,
    ) -> Self {
        let base_qty = config.base_order_size / entry_price;

        let mut levels = Vec::new();
        let mut level_price = entry_price;
        let mut projected = config.base_order_size;
        for (i, level_cfg) in config.levels.iter().enumerate() {
            let trigger_price = match side {
                PositionSide::Long => {
                    level_price * (Decimal::ONE - level_cfg.drop_percent / Decimal::ONE_HUNDRED)
                }
                PositionSide::Short => {
                    level_price * (Decimal::ONE + level_cfg.drop_percent / Decimal::ONE_HUNDRED)
                }
            };
            let order_size = config.base_order_size * level_cfg.multiplier;
            if projected + order_size > config.max_investment {
                break;
            }
            projected += order_size;
            levels.push(DcaLevel {
                index: (i + 1) as u32,
                trigger_price,
                order_size,
                multiplier: level_cfg.multiplier,
                status: DcaLevelStatus::Pending,
                filled_price: None,
                filled_qty: None,
                filled_at: None,
            });
            level_price = trigger_price;
        }

        let targets = targets
            .iter()
            .enumerate()
            .map(|(i, price)| TakeProfitTarget {
                index: (i + 1) as u32,
                price: *price,
                hit: false,
                hit_at: None,
            })
            .collect();

        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            symbol: symbol.into(),
            side,
            leverage,
            base_order_size: config.base_order_size,
            entry_price,
            total_filled_qty: base_qty,
            remaining_qty: base_qty,
            total_cost: config.base_order_size,
            total_invested: config.base_order_size,
            avg_entry: entry_price,
            max_investment: config.max_investment,
            realized_pnl: Decimal::ZERO,
            dca_levels: levels,
            targets,
            take_profit_percent: config.take_profit_percent,
            tp_mode: config.tp_mode,
            partial_tp_schema: config.partial_tp_schema.clone(),
            partial_tp_hits: 0,
            stop_loss_percent: config.stop_loss_percent,
            stop_loss_price,
            breakeven_sl: false,
            status: PositionStatus::Active,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    // ==================== DCA levels ====================

    /// Arm every pending level whose trigger the price has crossed and
    /// return their indexes into `dca_levels`. Fill state is untouched.
    pub fn check_dca_triggers(&mut self, current_price: Decimal) -> Vec<usize> {
        if !self.is_open() {
            return Vec::new();
        }

        let mut triggered = Vec::new();
        for (i, level) in self.dca_levels.iter_mut().enumerate() {
            if level.status != DcaLevelStatus::Pending {
                continue;
            }
            let crossed = match self.side {
                PositionSide::Long => current_price <= level.trigger_price,
                PositionSide::Short => current_price >= level.trigger_price,
            };
            if crossed {
                level.status = DcaLevelStatus::Triggered;
                triggered.push(i);
            }
        }
        triggered
    }

    /// Indexes of levels armed but not yet confirmed filled. Order placement
    /// that fails is retried from here on the next tick.
    pub fn triggered_levels(&self) -> Vec<usize> {
        self.dca_levels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.status == DcaLevelStatus::Triggered)
            .map(|(i, _)| i)
            .collect()
    }

    /// Record a confirmed exchange fill for a level and recompute the
    /// weighted average entry. All subsequent TP/SL thresholds key off the
    /// new average, which is the defining property of the strategy.
    pub fn fill_level(&mut self, index: usize, fill_price: Decimal, fill_qty: Decimal) {
        let level = &mut self.dca_levels[index];
        level.status = DcaLevelStatus::Filled;
        level.filled_price = Some(fill_price);
        level.filled_qty = Some(fill_qty);
        level.filled_at = Some(Utc::now());
        let order_size = level.order_size;

        self.total_filled_qty += fill_qty;
        self.remaining_qty += fill_qty;
        self.total_cost += fill_price * fill_qty;
        self.total_invested += order_size;

        if !self.total_filled_qty.is_zero() {
            self.avg_entry = self.total_cost / self.total_filled_qty;
        }
    }

    // ==================== Take profit ====================

    /// Take-profit threshold relative to the current average entry.
    pub fn take_profit_price(&self) -> Decimal {
        let pct = self.take_profit_percent / Decimal::ONE_HUNDRED;
        match self.side {
            PositionSide::Long => self.avg_entry * (Decimal::ONE + pct),
            PositionSide::Short => self.avg_entry * (Decimal::ONE - pct),
        }
    }

    /// Check whether take profit fires at this price.
    pub fn check_take_profit(&self, current_price: Decimal) -> Option<TpHit> {
        if !self.is_open() {
            return None;
        }

        let tp_price = self.take_profit_price();
        let crossed = match self.side {
            PositionSide::Long => current_price >= tp_price,
            PositionSide::Short => current_price <= tp_price,
        };
        if !crossed {
            return None;
        }

        match self.tp_mode {
            TpMode::Whole => Some(TpHit::Whole),
            TpMode::Partial => {
                if self.partial_tp_hits < self.partial_tp_schema.len() {
                    Some(TpHit::Partial {
                        step: self.partial_tp_hits,
                    })
                } else {
                    None
                }
            }
        }
    }

    /// Quantity a take-profit hit will close, for sizing the exchange call
    /// before any engine state changes.
    pub fn tp_close_qty(&self, hit: TpHit) -> Decimal {
        match hit {
            TpHit::Whole => self.remaining_qty,
            TpHit::Partial { step } => {
                if step + 1 == self.partial_tp_schema.len() {
                    self.remaining_qty
                } else {
                    let pct = self.partial_tp_schema[step] / Decimal::ONE_HUNDRED;
                    (self.total_filled_qty * pct).min(self.remaining_qty)
                }
            }
        }
    }

    /// Execute a take profit confirmed by the exchange.
    pub fn execute_take_profit(&mut self, hit: TpHit, exit_price: Decimal) -> CloseOutcome {
        match hit {
            TpHit::Whole => self.close_remaining(exit_price, PositionStatus::TpClosed),
            TpHit::Partial { step } => {
                let last_step = step + 1 == self.partial_tp_schema.len();
                let closed_qty = self.tp_close_qty(hit);

                let pnl = self.pnl_for(closed_qty, exit_price);
                self.remaining_qty -= closed_qty;
                self.realized_pnl += pnl;
                self.partial_tp_hits += 1;

                // First partial promotes the stop to breakeven, permanently.
                let breakeven_promoted = step == 0 && !self.breakeven_sl;
                if breakeven_promoted {
                    self.breakeven_sl = true;
                }

                let fully_closed = last_step || self.remaining_qty.is_zero();
                if fully_closed {
                    self.status = PositionStatus::TpClosed;
                    self.closed_at = Some(Utc::now());
                } else {
                    self.status = PositionStatus::PartiallyClosed;
                }

                CloseOutcome {
                    closed_qty,
                    exit_price,
                    avg_entry: self.avg_entry,
                    pnl,
                    breakeven_promoted,
                    fully_closed,
                }
            }
        }
    }

    // ==================== Stop loss ====================

    /// Current effective stop price. Breakeven supersedes both the explicit
    /// signal stop and the percent-derived stop.
    pub fn stop_price(&self) -> Decimal {
        if self.breakeven_sl {
            return self.avg_entry;
        }
        if let Some(price) = self.stop_loss_price {
            return price;
        }
        let pct = self.stop_loss_percent / Decimal::ONE_HUNDRED;
        match self.side {
            PositionSide::Long => self.avg_entry * (Decimal::ONE - pct),
            PositionSide::Short => self.avg_entry * (Decimal::ONE + pct),
        }
    }

    /// Check whether the stop loss fires at this price.
    pub fn check_stop_loss(&self, current_price: Decimal) -> bool {
        if !self.is_open() {
            return false;
        }
        let stop = self.stop_price();
        match self.side {
            PositionSide::Long => current_price <= stop,
            PositionSide::Short => current_price >= stop,
        }
    }

    /// Execute a stop loss: always closes 100% of the remaining quantity.
    pub fn execute_stop_loss(&mut self, exit_price: Decimal) -> CloseOutcome {
        self.close_remaining(exit_price, PositionStatus::SlClosed)
    }

    // ==================== Targets ====================

    /// The next unreached progressive target, walked strictly in index
    /// order.
    pub fn next_target(&self) -> Option<&TakeProfitTarget> {
        self.targets.iter().find(|t| !t.hit)
    }

    /// Whether a target price has been crossed at this price.
    pub fn target_crossed(&self, target: &TakeProfitTarget, current_price: Decimal) -> bool {
        match self.side {
            PositionSide::Long => current_price >= target.price,
            PositionSide::Short => current_price <= target.price,
        }
    }

    /// Quantity a target hit will close. The final target closes everything
    /// that remains, absorbing rounding residue; earlier targets take their
    /// split-schema share (equal split when the schema has no entry).
    pub fn target_close_qty(&self, target_index: u32) -> Decimal {
        if target_index as usize == self.targets.len() {
            return self.remaining_qty;
        }
        let schema_slot = (target_index as usize).saturating_sub(1);
        let pct = self
            .partial_tp_schema
            .get(schema_slot)
            .copied()
            .unwrap_or_else(|| {
                Decimal::ONE_HUNDRED / Decimal::from(self.targets.len().max(1) as u32)
            })
            / Decimal::ONE_HUNDRED;
        (self.total_filled_qty * pct).min(self.remaining_qty)
    }

    /// Close the portion of the position owed to a target.
    pub fn execute_target(&mut self, target_index: u32, exit_price: Decimal) -> CloseOutcome {
        let last_target = target_index as usize == self.targets.len();
        let closed_qty = self.target_close_qty(target_index);

        if let Some(target) = self
            .targets
            .iter_mut()
            .find(|t| t.index == target_index && !t.hit)
        {
            target.hit = true;
            target.hit_at = Some(Utc::now());
        }

        let pnl = self.pnl_for(closed_qty, exit_price);
        self.remaining_qty -= closed_qty;
        self.realized_pnl += pnl;

        let fully_closed = last_target || self.remaining_qty.is_zero();
        if fully_closed {
            self.status = PositionStatus::TpClosed;
            self.closed_at = Some(Utc::now());
        } else {
            self.status = PositionStatus::PartiallyClosed;
        }

        CloseOutcome {
            closed_qty,
            exit_price,
            avg_entry: self.avg_entry,
            pnl,
            breakeven_promoted: false,
            fully_closed,
        }
    }

    // ==================== Closing ====================

    /// Close up to `qty` at `exit_price`. When everything is gone the
    /// position lands in `terminal_status`; otherwise it stays partially
    /// closed. Used by the OCO path, which may close less than the whole.
    pub fn close_partial(
        &mut self,
        qty: Decimal,
        exit_price: Decimal,
        terminal_status: PositionStatus,
    ) -> CloseOutcome {
        let closed_qty = qty.min(self.remaining_qty);
        let pnl = self.pnl_for(closed_qty, exit_price);

        self.remaining_qty -= closed_qty;
        self.realized_pnl += pnl;

        let fully_closed = self.remaining_qty.is_zero();
        if fully_closed {
            self.status = terminal_status;
            self.closed_at = Some(Utc::now());
        } else {
            self.status = PositionStatus::PartiallyClosed;
        }

        CloseOutcome {
            closed_qty,
            exit_price,
            avg_entry: self.avg_entry,
            pnl,
            breakeven_promoted: false,
            fully_closed,
        }
    }

    /// Close the whole remaining quantity into a terminal state. Used by
    /// stop loss, whole take profit, manual close, and auto-close.
    pub fn close_remaining(
        &mut self,
        exit_price: Decimal,
        to_status: PositionStatus,
    ) -> CloseOutcome {
        self.close_partial(self.remaining_qty, exit_price, to_status)
    }

    /// Realized PnL for closing `qty` at `exit_price` against the current
    /// average entry.
    pub fn pnl_for(&self, qty: Decimal, exit_price: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (exit_price - self.avg_entry) * qty,
            PositionSide::Short => (self.avg_entry - exit_price) * qty,
        }
    }

    /// Unrealized PnL of the open remainder at the given price.
    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        self.pnl_for(self.remaining_qty, current_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_position(config: &DcaConfig) -> Position {
        Position::open(
            "user-1",
            "BTCUSDT",
            PositionSide::Long,
            dec!(100),
            10,
            config,
            &[],
            None,
        )
    }

    #[test]
    fn base_order_recorded_as_first_fill() {
        let config = DcaConfig::default();
        let pos = long_position(&config);

        assert_eq!(pos.total_filled_qty, dec!(0.1));
        assert_eq!(pos.remaining_qty, dec!(0.1));
        assert_eq!(pos.avg_entry, dec!(100));
        assert_eq!(pos.total_invested, dec!(10));
        assert_eq!(pos.status, PositionStatus::Active);
    }

    #[test]
    fn levels_compound_off_previous_trigger() {
        let config = DcaConfig::default();
        let pos = long_position(&config);

        // 1.5% off 100, then 2.0% off 98.5, then 3.0% off 96.53
        assert_eq!(pos.dca_levels[0].trigger_price, dec!(98.5));
        assert_eq!(pos.dca_levels[1].trigger_price, dec!(96.53));
        assert_eq!(pos.dca_levels[2].trigger_price.round_dp(4), dec!(93.6341));
    }

    #[test]
    fn level_generation_halts_at_investment_cap() {
        let config = DcaConfig {
            base_order_size: dec!(100),
            max_investment: dec!(250),
            ..Default::default()
        };
        let pos = Position::open(
            "user-1",
            "BTCUSDT",
            PositionSide::Long,
            dec!(100),
            10,
            &config,
            &[],
            None,
        );

        // Base 100 + level1 100 fits; level2 (150) would exceed 250.
        assert_eq!(pos.dca_levels.len(), 1);
    }

    #[test]
    fn average_entry_tracks_total_cost_over_quantity() {
        let config = DcaConfig::default();
        let mut pos = long_position(&config);

        let triggered = pos.check_dca_triggers(dec!(98.4));
        assert_eq!(triggered, vec![0]);

        let fill_qty = dec!(10) / dec!(98.5);
        pos.fill_level(0, dec!(98.5), fill_qty);

        assert_eq!(pos.avg_entry, pos.total_cost / pos.total_filled_qty);
        assert_eq!(pos.avg_entry.round_dp(2), dec!(99.24));
    }

    #[test]
    fn take_profit_keys_off_average_entry_not_original() {
        let config = DcaConfig::default();
        let mut pos = long_position(&config);

        pos.check_dca_triggers(dec!(98.4));
        pos.fill_level(0, dec!(98.5), dec!(10) / dec!(98.5));

        // TP at 1.2% over avg (~99.24) sits near 100.44, far below 101.2.
        let tp = pos.take_profit_price();
        assert!(tp < dec!(100.44));
        assert!(tp > dec!(100.43));

        assert!(pos.check_take_profit(dec!(100.43)).is_none());
        assert_eq!(pos.check_take_profit(dec!(100.44)), Some(TpHit::Whole));
    }

    #[test]
    fn short_side_mirrors_triggers() {
        let config = DcaConfig::default();
        let mut pos = Position::open(
            "user-1",
            "BTCUSDT",
            PositionSide::Short,
            dec!(100),
            10,
            &config,
            &[],
            None,
        );

        assert_eq!(pos.dca_levels[0].trigger_price, dec!(101.5));
        assert!(pos.check_dca_triggers(dec!(101.4)).is_empty());
        assert_eq!(pos.check_dca_triggers(dec!(101.6)), vec![0]);

        // Short TP is below entry, SL above.
        assert_eq!(pos.take_profit_price(), dec!(98.8));
        assert_eq!(pos.stop_price(), dec!(103.0));
        assert!(pos.check_stop_loss(dec!(103.1)));
    }

    #[test]
    fn first_partial_close_promotes_breakeven_stop() {
        let config = DcaConfig {
            tp_mode: TpMode::Partial,
            ..Default::default()
        };
        let mut pos = long_position(&config);
        let original_stop = pos.stop_price();

        let hit = pos.check_take_profit(dec!(101.3)).expect("tp should fire");
        assert_eq!(hit, TpHit::Partial { step: 0 });

        let outcome = pos.execute_take_profit(hit, dec!(101.3));
        assert!(outcome.breakeven_promoted);
        assert_eq!(outcome.closed_qty, dec!(0.03));
        assert_eq!(pos.status, PositionStatus::PartiallyClosed);

        // Breakeven supersedes the original stop: the stop now sits at the
        // average entry, so a dip to the old stop level exits at breakeven
        // with zero loss instead of the original -3%.
        assert_eq!(pos.stop_price(), pos.avg_entry);
        assert!(pos.stop_price() > original_stop);
        assert!(pos.check_stop_loss(dec!(99.9)));
        let sl_outcome = pos.execute_stop_loss(pos.avg_entry);
        assert_eq!(sl_outcome.pnl, Decimal::ZERO);
    }

    #[test]
    fn breakeven_ratchet_is_never_removed() {
        let config = DcaConfig {
            tp_mode: TpMode::Partial,
            ..Default::default()
        };
        let mut pos = long_position(&config);

        let hit = pos.check_take_profit(dec!(101.3)).unwrap();
        pos.execute_take_profit(hit, dec!(101.3));
        assert!(pos.breakeven_sl);

        // A later DCA fill moves the average but breakeven stays set.
        pos.check_dca_triggers(dec!(98.4));
        pos.fill_level(0, dec!(98.5), dec!(10) / dec!(98.5));
        assert!(pos.breakeven_sl);
        assert_eq!(pos.stop_price(), pos.avg_entry);
    }

    #[test]
    fn partial_sequence_conserves_quantity() {
        let config = DcaConfig {
            tp_mode: TpMode::Partial,
            ..Default::default()
        };
        let mut pos = long_position(&config);
        let original_qty = pos.total_filled_qty;

        let mut closed_total = Decimal::ZERO;
        for _ in 0..3 {
            let hit = pos.check_take_profit(dec!(101.3)).expect("tp step");
            let outcome = pos.execute_take_profit(hit, dec!(101.3));
            closed_total += outcome.closed_qty;
        }

        assert_eq!(pos.remaining_qty + closed_total, original_qty);
        assert_eq!(pos.remaining_qty, Decimal::ZERO);
        assert_eq!(pos.status, PositionStatus::TpClosed);
        assert!(pos.check_take_profit(dec!(102)).is_none());
    }

    #[test]
    fn stop_loss_closes_full_remaining_quantity() {
        let config = DcaConfig::default();
        let mut pos = long_position(&config);

        assert!(pos.check_stop_loss(dec!(96.9)));
        let outcome = pos.execute_stop_loss(dec!(96.9));

        assert_eq!(outcome.closed_qty, dec!(0.1));
        assert!(outcome.pnl < Decimal::ZERO);
        assert_eq!(pos.remaining_qty, Decimal::ZERO);
        assert_eq!(pos.status, PositionStatus::SlClosed);
    }

    #[test]
    fn explicit_signal_stop_overrides_percent() {
        let config = DcaConfig::default();
        let pos = Position::open(
            "user-1",
            "BTCUSDT",
            PositionSide::Long,
            dec!(100),
            10,
            &config,
            &[],
            Some(dec!(95)),
        );

        assert_eq!(pos.stop_price(), dec!(95));
        assert!(!pos.check_stop_loss(dec!(96)));
        assert!(pos.check_stop_loss(dec!(94.9)));
    }

    #[test]
    fn no_transitions_out_of_terminal_state() {
        let config = DcaConfig::default();
        let mut pos = long_position(&config);
        pos.execute_stop_loss(dec!(96.9));

        assert!(pos.check_dca_triggers(dec!(90)).is_empty());
        assert!(pos.check_take_profit(dec!(110)).is_none());
        assert!(!pos.check_stop_loss(dec!(50)));
    }

    #[test]
    fn final_target_absorbs_rounding_residue() {
        let config = DcaConfig::default();
        let mut pos = Position::open(
            "user-1",
            "BTCUSDT",
            PositionSide::Long,
            dec!(100),
            10,
            &config,
            &[dec!(101), dec!(102), dec!(103)],
            None,
        );
        let original_qty = pos.total_filled_qty;

        let first = pos.next_target().unwrap().index;
        let o1 = pos.execute_target(first, dec!(101));
        assert!(!o1.fully_closed);
        assert_eq!(pos.status, PositionStatus::PartiallyClosed);

        let second = pos.next_target().unwrap().index;
        let o2 = pos.execute_target(second, dec!(102));
        assert!(!o2.fully_closed);

        let third = pos.next_target().unwrap().index;
        let o3 = pos.execute_target(third, dec!(103));
        assert!(o3.fully_closed);
        assert_eq!(pos.remaining_qty, Decimal::ZERO);
        assert_eq!(
            o1.closed_qty + o2.closed_qty + o3.closed_qty,
            original_qty
        );
        assert_eq!(pos.status, PositionStatus::TpClosed);
        assert!(pos.next_target().is_none());
    }
}
