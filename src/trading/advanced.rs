//! Advanced order evaluation: trailing stops and OCO pairs, independent of
//! the DCA level machinery.

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::models::{OcoOrder, OcoSide, OcoStatus, Position, PositionSide, TrailingStop};

/// A trailing stop that crossed its stop price this tick.
#[derive(Debug, Clone)]
pub struct TrailingFire {
    pub position_id: String,
    pub symbol: String,
    pub stop_price: Decimal,
    pub current_price: Decimal,
}

/// An OCO order with one leg crossed this tick.
#[derive(Debug, Clone)]
pub struct OcoFire {
    pub oco_id: String,
    pub position_id: String,
    pub symbol: String,
    pub executed_side: OcoSide,
    pub execution_price: Decimal,
    pub quantity: Decimal,
    pub current_price: Decimal,
}

/// Tracks and evaluates all trailing stops and OCO orders against per-tick
/// price snapshots.
#[derive(Debug, Default)]
pub struct AdvancedOrderEvaluator {
    /// Keyed by position id: at most one trailing stop per position
    trailing_stops: HashMap<String, TrailingStop>,
    /// Keyed by OCO id
    oco_orders: HashMap<String, OcoOrder>,
}

impl AdvancedOrderEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== Registration ====================

    /// Attach a trailing stop to an open position. Exactly one of
    /// percent/amount must be given.
    pub fn create_trailing_stop(
        &mut self,
        position: &Position,
        reference_price: Decimal,
        trail_percent: Option<Decimal>,
        trail_amount: Option<Decimal>,
        activation_price: Option<Decimal>,
    ) -> Result<TrailingStop> {
        if !position.is_open() {
            bail!("position {} is not active", position.id);
        }
        match (trail_percent, trail_amount) {
            (Some(pct), None) if pct > Decimal::ZERO => {}
            (None, Some(amt)) if amt > Decimal::ZERO => {}
            _ => bail!("exactly one of trail_percent or trail_amount must be positive"),
        }

        let stop = TrailingStop::new(
            &position.id,
            position.side,
            reference_price,
            trail_percent,
            trail_amount,
            activation_price,
        );
        info!(
            position_id = %position.id,
            stop = %stop.current_stop,
            active = stop.active,
            "trailing stop created"
        );
        self.trailing_stops.insert(position.id.clone(), stop.clone());
        Ok(stop)
    }

    /// Attach an OCO pair to an open position, validating leg placement
    /// against the current average entry.
    pub fn create_oco_order(
        &mut self,
        position: &Position,
        take_profit_price: Decimal,
        stop_loss_price: Decimal,
        quantity: Option<Decimal>,
    ) -> Result<OcoOrder> {
        if !position.is_open() {
            bail!("position {} is not active", position.id);
        }
        match position.side {
            PositionSide::Long => {
                if take_profit_price <= position.avg_entry {
                    bail!("take profit must be above entry for LONG");
                }
                if stop_loss_price >= position.avg_entry {
                    bail!("stop loss must be below entry for LONG");
                }
            }
            PositionSide::Short => {
                if take_profit_price >= position.avg_entry {
                    bail!("take profit must be below entry for SHORT");
                }
                if stop_loss_price <= position.avg_entry {
                    bail!("stop loss must be above entry for SHORT");
                }
            }
        }

        let order = OcoOrder::new(
            &position.id,
            take_profit_price,
            stop_loss_price,
            quantity.unwrap_or(position.remaining_qty),
        );
        info!(oco_id = %order.id, position_id = %position.id, "OCO order created");
        self.oco_orders.insert(order.id.clone(), order.clone());
        Ok(order)
    }

    pub fn cancel_oco_order(&mut self, oco_id: &str) -> Result<()> {
        let Some(order) = self.oco_orders.get_mut(oco_id) else {
            bail!("OCO order {oco_id} not found");
        };
        if order.status != OcoStatus::Active {
            bail!("OCO order {oco_id} is not active");
        }
        order.status = OcoStatus::Cancelled;
        info!(oco_id, "OCO order cancelled");
        Ok(())
    }

    pub fn trailing_stop_for(&self, position_id: &str) -> Option<&TrailingStop> {
        self.trailing_stops.get(position_id)
    }

    pub fn oco_order(&self, oco_id: &str) -> Option<&OcoOrder> {
        self.oco_orders.get(oco_id)
    }

    // ==================== Evaluation ====================

    /// Ratchet every trailing stop against the snapshot and collect fires.
    /// Stops bound to closed or vanished positions are dropped.
    pub fn update_trailing_stops(
        &mut self,
        prices: &HashMap<String, Decimal>,
        positions: &HashMap<String, Position>,
    ) -> Vec<TrailingFire> {
        let mut fired = Vec::new();
        let mut stale = Vec::new();

        for (position_id, trailing) in self.trailing_stops.iter_mut() {
            let Some(position) = positions.get(position_id).filter(|p| p.is_open()) else {
                stale.push(position_id.clone());
                continue;
            };
            let Some(&current_price) = prices.get(&position.symbol) else {
                continue;
            };

            let update = trailing.update(position.side, current_price);
            if update.ratcheted {
                debug!(
                    position_id = %position_id,
                    stop = %trailing.current_stop,
                    "trailing stop ratcheted"
                );
            }
            if update.fired {
                info!(
                    position_id = %position_id,
                    stop = %trailing.current_stop,
                    price = %current_price,
                    "trailing stop fired"
                );
                fired.push(TrailingFire {
                    position_id: position_id.clone(),
                    symbol: position.symbol.clone(),
                    stop_price: trailing.current_stop,
                    current_price,
                });
                stale.push(position_id.clone());
            }
        }

        for id in stale {
            self.trailing_stops.remove(&id);
        }
        fired
    }

    /// Evaluate every active OCO pair against the snapshot. The first leg
    /// crossed executes; the other leg is void by construction. Orders
    /// bound to closed positions are cancelled.
    pub fn check_oco_orders(
        &mut self,
        prices: &HashMap<String, Decimal>,
        positions: &HashMap<String, Position>,
    ) -> Vec<OcoFire> {
        let mut fired = Vec::new();

        for order in self.oco_orders.values_mut() {
            if order.status != OcoStatus::Active {
                continue;
            }
            let Some(position) = positions.get(&order.position_id) else {
                order.status = OcoStatus::Cancelled;
                continue;
            };
            if !position.is_open() {
                order.status = OcoStatus::Cancelled;
                continue;
            }
            let Some(&current_price) = prices.get(&position.symbol) else {
                continue;
            };

            if let Some(side) = order.evaluate(position.side, current_price) {
                let execution_price = match side {
                    OcoSide::TakeProfit => order.take_profit_price,
                    OcoSide::StopLoss => order.stop_loss_price,
                };
                order.mark_executed(side);
                info!(
                    oco_id = %order.id,
                    position_id = %order.position_id,
                    side = side.as_str(),
                    price = %execution_price,
                    "OCO order executed"
                );
                fired.push(OcoFire {
                    oco_id: order.id.clone(),
                    position_id: order.position_id.clone(),
                    symbol: position.symbol.clone(),
                    executed_side: side,
                    execution_price,
                    quantity: order.quantity,
                    current_price,
                });
            }
        }

        fired
    }

    /// Drop executed and cancelled OCO orders.
    pub fn sweep(&mut self) {
        self.oco_orders
            .retain(|_, order| order.status == OcoStatus::Active);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionSide;
    use crate::trading::config::DcaConfig;
    use rust_decimal_macros::dec;

    fn open_long() -> Position {
        Position::open(
            "user-1",
            "BTCUSDT",
            PositionSide::Long,
            dec!(100),
            10,
            &DcaConfig::default(),
            &[],
            None,
        )
    }

    fn snapshot(price: Decimal) -> HashMap<String, Decimal> {
        HashMap::from([("BTCUSDT".to_string(), price)])
    }

    fn tracked(position: &Position) -> HashMap<String, Position> {
        HashMap::from([(position.id.clone(), position.clone())])
    }

    #[test]
    fn trailing_stop_requires_exactly_one_trail_mode() {
        let mut evaluator = AdvancedOrderEvaluator::new();
        let position = open_long();

        assert!(evaluator
            .create_trailing_stop(&position, dec!(100), None, None, None)
            .is_err());
        assert!(evaluator
            .create_trailing_stop(&position, dec!(100), Some(dec!(2)), Some(dec!(1)), None)
            .is_err());
        assert!(evaluator
            .create_trailing_stop(&position, dec!(100), Some(dec!(2)), None, None)
            .is_ok());
    }

    #[test]
    fn trailing_fire_removes_the_stop() {
        let mut evaluator = AdvancedOrderEvaluator::new();
        let position = open_long();
        evaluator
            .create_trailing_stop(&position, dec!(100), Some(dec!(2)), None, None)
            .unwrap();
        let positions = tracked(&position);

        // Ride up, then cross the ratcheted stop.
        assert!(evaluator
            .update_trailing_stops(&snapshot(dec!(110)), &positions)
            .is_empty());
        let fires = evaluator.update_trailing_stops(&snapshot(dec!(107)), &positions);

        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].stop_price, dec!(107.8));
        assert!(evaluator.trailing_stop_for(&position.id).is_none());
    }

    #[test]
    fn stops_for_closed_positions_are_dropped() {
        let mut evaluator = AdvancedOrderEvaluator::new();
        let mut position = open_long();
        evaluator
            .create_trailing_stop(&position, dec!(100), Some(dec!(2)), None, None)
            .unwrap();

        position.execute_stop_loss(dec!(97));
        let fires = evaluator.update_trailing_stops(&snapshot(dec!(96)), &tracked(&position));

        assert!(fires.is_empty());
        assert!(evaluator.trailing_stop_for(&position.id).is_none());
    }

    #[test]
    fn oco_rejects_misplaced_legs() {
        let mut evaluator = AdvancedOrderEvaluator::new();
        let position = open_long();

        // TP below entry for a LONG is invalid, as is SL above entry.
        assert!(evaluator
            .create_oco_order(&position, dec!(99), dec!(95), None)
            .is_err());
        assert!(evaluator
            .create_oco_order(&position, dec!(110), dec!(101), None)
            .is_err());
        assert!(evaluator
            .create_oco_order(&position, dec!(110), dec!(95), None)
            .is_ok());
    }

    #[test]
    fn oco_executes_first_crossed_leg_once() {
        let mut evaluator = AdvancedOrderEvaluator::new();
        let position = open_long();
        let oco_id = evaluator
            .create_oco_order(&position, dec!(110), dec!(95), None)
            .unwrap()
            .id;
        let positions = tracked(&position);

        let fires = evaluator.check_oco_orders(&snapshot(dec!(94)), &positions);
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].executed_side, OcoSide::StopLoss);
        assert_eq!(fires[0].execution_price, dec!(95));

        // The executed order never fires again, even past the other leg.
        let fires = evaluator.check_oco_orders(&snapshot(dec!(120)), &positions);
        assert!(fires.is_empty());
        assert_eq!(
            evaluator.oco_order(&oco_id).unwrap().status,
            OcoStatus::Executed
        );
    }

    #[test]
    fn oco_bound_to_closed_position_is_cancelled() {
        let mut evaluator = AdvancedOrderEvaluator::new();
        let mut position = open_long();
        let oco_id = evaluator
            .create_oco_order(&position, dec!(110), dec!(95), None)
            .unwrap()
            .id;

        position.execute_stop_loss(dec!(97));
        evaluator.check_oco_orders(&snapshot(dec!(120)), &tracked(&position));

        assert_eq!(
            evaluator.oco_order(&oco_id).unwrap().status,
            OcoStatus::Cancelled
        );
    }
}
