//! Advanced order models: trailing stops and one-cancels-other pairs.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::position::PositionSide;

/// A trailing stop bound to one position.
///
/// The stop ratchets in the position's favor as the best observed price
/// improves and never loosens. It fires only when price actually crosses
/// the current stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStop {
    pub position_id: String,

    /// Trail distance as percent of the best price (exclusive with amount)
    pub trail_percent: Option<Decimal>,

    /// Trail distance as an absolute price offset (exclusive with percent)
    pub trail_amount: Option<Decimal>,

    /// Best price seen: highest for LONG, lowest for SHORT
    pub best_price: Decimal,

    /// Current stop price
    pub current_stop: Decimal,

    /// Ratcheting only happens while active
    pub active: bool,

    /// Price that must be crossed before ratcheting starts
    pub activation_price: Option<Decimal>,

    pub created_at: DateTime<Utc>,
}

/// What a single price tick did to a trailing stop.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrailUpdate {
    pub activated: bool,
    pub ratcheted: bool,
    pub fired: bool,
}

impl TrailingStop {
    /// Create a trailing stop seeded from the position's reference price.
    /// Exactly one of `trail_percent` / `trail_amount` must be set.
    pub fn new(
        position_id: impl Into<String>,
        side: PositionSide,
        reference_price: Decimal,
        trail_percent: Option<Decimal>,
        trail_amount: Option<Decimal>,
        activation_price: Option<Decimal>,
    ) -> Self {
        let mut stop = Self {
            position_id: position_id.into(),
            trail_percent,
            trail_amount,
            best_price: reference_price,
            current_stop: Decimal::ZERO,
            active: activation_price.is_none(),
            activation_price,
            created_at: Utc::now(),
        };
        stop.current_stop = stop.stop_for(side, reference_price);
        stop
    }

    fn stop_for(&self, side: PositionSide, best: Decimal) -> Decimal {
        let distance = if let Some(pct) = self.trail_percent {
            best * pct / Decimal::ONE_HUNDRED
        } else {
            self.trail_amount.unwrap_or_default()
        };
        match side {
            PositionSide::Long => best - distance,
            PositionSide::Short => best + distance,
        }
    }

    /// Feed one price observation through the ratchet.
    pub fn update(&mut self, side: PositionSide, current_price: Decimal) -> TrailUpdate {
        let mut result = TrailUpdate::default();

        if !self.active {
            let Some(activation) = self.activation_price else {
                return result;
            };
            let crossed = match side {
                PositionSide::Long => current_price >= activation,
                PositionSide::Short => current_price <= activation,
            };
            if !crossed {
                return result;
            }
            self.active = true;
            result.activated = true;
        }

        let improved = match side {
            PositionSide::Long => current_price > self.best_price,
            PositionSide::Short => current_price < self.best_price,
        };
        if improved {
            self.best_price = current_price;
            let candidate = self.stop_for(side, self.best_price);
            // The stop only ever tightens.
            let tightens = match side {
                PositionSide::Long => candidate > self.current_stop,
                PositionSide::Short => candidate < self.current_stop,
            };
            if tightens {
                self.current_stop = candidate;
                result.ratcheted = true;
            }
        }

        result.fired = match side {
            PositionSide::Long => current_price <= self.current_stop,
            PositionSide::Short => current_price >= self.current_stop,
        };
        result
    }
}

/// Lifecycle of an OCO order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcoStatus {
    Active,
    Executed,
    Cancelled,
}

/// Which leg of an OCO pair fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcoSide {
    TakeProfit,
    StopLoss,
}

impl OcoSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcoSide::TakeProfit => "take_profit",
            OcoSide::StopLoss => "stop_loss",
        }
    }
}

/// A take-profit/stop-loss pair where the first leg crossed voids the
/// other. Cancellation of the losing leg is structural, not a second state
/// transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcoOrder {
    pub id: String,
    pub position_id: String,
    pub take_profit_price: Decimal,
    pub stop_loss_price: Decimal,
    pub quantity: Decimal,
    pub status: OcoStatus,
    pub executed_side: Option<OcoSide>,
    pub created_at: DateTime<Utc>,
}

impl OcoOrder {
    pub fn new(
        position_id: impl Into<String>,
        take_profit_price: Decimal,
        stop_loss_price: Decimal,
        quantity: Decimal,
    ) -> Self {
        Self {
            id: format!("oco_{}", &Uuid::new_v4().simple().to_string()[..8]),
            position_id: position_id.into(),
            take_profit_price,
            stop_loss_price,
            quantity,
            status: OcoStatus::Active,
            executed_side: None,
            created_at: Utc::now(),
        }
    }

    /// Evaluate both legs at this price; the first crossed wins. Take
    /// profit is checked first when both cross within one observation.
    pub fn evaluate(&self, side: PositionSide, current_price: Decimal) -> Option<OcoSide> {
        if self.status != OcoStatus::Active {
            return None;
        }
        let (tp_hit, sl_hit) = match side {
            PositionSide::Long => (
                current_price >= self.take_profit_price,
                current_price <= self.stop_loss_price,
            ),
            PositionSide::Short => (
                current_price <= self.take_profit_price,
                current_price >= self.stop_loss_price,
            ),
        };
        if tp_hit {
            Some(OcoSide::TakeProfit)
        } else if sl_hit {
            Some(OcoSide::StopLoss)
        } else {
            None
        }
    }

    /// Mark one leg executed; the other is implicitly void.
    pub fn mark_executed(&mut self, side: OcoSide) {
        self.status = OcoStatus::Executed;
        self.executed_side = Some(side);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn trailing_stop_ratchets_up_never_down() {
        let mut ts = TrailingStop::new("pos-1", PositionSide::Long, dec!(100), Some(dec!(2)), None, None);
        assert_eq!(ts.current_stop, dec!(98));

        // Favorable move tightens the stop.
        let up = ts.update(PositionSide::Long, dec!(110));
        assert!(up.ratcheted);
        assert_eq!(ts.current_stop, dec!(107.8));

        // Unfavorable move leaves the stop untouched.
        let down = ts.update(PositionSide::Long, dec!(108));
        assert!(!down.ratcheted);
        assert!(!down.fired);
        assert_eq!(ts.current_stop, dec!(107.8));

        // Crossing the stop fires.
        let crossed = ts.update(PositionSide::Long, dec!(107.5));
        assert!(crossed.fired);
    }

    #[test]
    fn trailing_stop_monotonic_over_price_path() {
        let mut ts = TrailingStop::new("pos-1", PositionSide::Long, dec!(100), Some(dec!(2)), None, None);
        let mut last_stop = ts.current_stop;

        for price in [
            dec!(101),
            dec!(99),
            dec!(104),
            dec!(103),
            dec!(108),
            dec!(102),
        ] {
            ts.update(PositionSide::Long, price);
            assert!(ts.current_stop >= last_stop);
            last_stop = ts.current_stop;
        }
    }

    #[test]
    fn short_trailing_stop_tracks_lowest_price() {
        let mut ts = TrailingStop::new("pos-1", PositionSide::Short, dec!(100), None, Some(dec!(1)), None);
        assert_eq!(ts.current_stop, dec!(101));

        ts.update(PositionSide::Short, dec!(95));
        assert_eq!(ts.best_price, dec!(95));
        assert_eq!(ts.current_stop, dec!(96));

        let fired = ts.update(PositionSide::Short, dec!(96.5));
        assert!(fired.fired);
    }

    #[test]
    fn activation_price_defers_ratcheting() {
        let mut ts = TrailingStop::new(
            "pos-1",
            PositionSide::Long,
            dec!(100),
            Some(dec!(2)),
            None,
            Some(dec!(105)),
        );
        assert!(!ts.active);

        // Below activation nothing happens, even on favorable moves.
        let idle = ts.update(PositionSide::Long, dec!(104));
        assert!(!idle.activated && !idle.ratcheted && !idle.fired);
        assert_eq!(ts.best_price, dec!(100));

        let live = ts.update(PositionSide::Long, dec!(105));
        assert!(live.activated);
        assert!(ts.active);
        assert_eq!(ts.current_stop, dec!(102.9));
    }

    #[test]
    fn oco_take_profit_leg_wins() {
        let oco = OcoOrder::new("pos-1", dec!(110), dec!(95), dec!(1));

        assert_eq!(oco.evaluate(PositionSide::Long, dec!(100)), None);
        assert_eq!(
            oco.evaluate(PositionSide::Long, dec!(111)),
            Some(OcoSide::TakeProfit)
        );
        assert_eq!(
            oco.evaluate(PositionSide::Long, dec!(94)),
            Some(OcoSide::StopLoss)
        );
    }

    #[test]
    fn executed_oco_stops_evaluating() {
        let mut oco = OcoOrder::new("pos-1", dec!(110), dec!(95), dec!(1));
        oco.mark_executed(OcoSide::StopLoss);

        assert_eq!(oco.status, OcoStatus::Executed);
        assert_eq!(oco.executed_side, Some(OcoSide::StopLoss));
        assert_eq!(oco.evaluate(PositionSide::Long, dec!(120)), None);
    }
}
