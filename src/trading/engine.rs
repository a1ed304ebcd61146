//! Multi-position manager over the pure position state machine.
//!
//! The engine owns the in-memory working set of positions. Persistence
//! happens at the orchestrator through the position store; the engine is
//! deliberately free of I/O so every transition is unit-testable. All exit
//! execution goes through the orchestrator, which confirms the exchange
//! close before mutating engine state.

use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::debug;

use crate::models::{Position, PositionSide, PositionStatus};
use crate::trading::config::DcaConfig;

/// In-memory manager of DCA positions.
#[derive(Debug, Default)]
pub struct PositionEngine {
    positions: HashMap<String, Position>,
}

impl PositionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and track a position from a confirmed base fill.
    #[allow(clippy::too_many_arguments)]
    pub fn create_position(
        &mut self,
        owner_id: &str,
        symbol: &str,
        side: PositionSide,
        entry_price: Decimal,
        leverage: u32,
        config: &DcaConfig,
        targets: &[Decimal],
        stop_loss: Option<Decimal>,
    ) -> Position {
        let position = Position::open(
            owner_id, symbol, side, entry_price, leverage, config, targets, stop_loss,
        );
        self.positions.insert(position.id.clone(), position.clone());
        debug!(
            position_id = %position.id,
            symbol,
            side = position.side.as_str(),
            levels = position.dca_levels.len(),
            "position created"
        );
        position
    }

    /// Track a position restored from the store.
    pub fn adopt(&mut self, position: Position) {
        self.positions.insert(position.id.clone(), position);
    }

    pub fn get(&self, position_id: &str) -> Option<&Position> {
        self.positions.get(position_id)
    }

    pub fn get_mut(&mut self, position_id: &str) -> Option<&mut Position> {
        self.positions.get_mut(position_id)
    }

    pub fn positions(&self) -> &HashMap<String, Position> {
        &self.positions
    }

    /// All open positions, optionally restricted to one owner.
    pub fn active_positions(&self, owner_id: Option<&str>) -> Vec<&Position> {
        self.positions
            .values()
            .filter(|p| p.is_open())
            .filter(|p| owner_id.map_or(true, |o| p.owner_id == o))
            .collect()
    }

    /// Ids of all open positions, for tick iteration without holding
    /// borrows across mutations.
    pub fn active_ids(&self) -> Vec<String> {
        self.positions
            .values()
            .filter(|p| p.is_open())
            .map(|p| p.id.clone())
            .collect()
    }

    /// Ids of open positions on a symbol.
    pub fn active_ids_on_symbol(&self, symbol: &str) -> Vec<String> {
        self.positions
            .values()
            .filter(|p| p.is_open() && p.symbol == symbol)
            .map(|p| p.id.clone())
            .collect()
    }

    /// Symbols that currently carry exposure; drives the per-tick price
    /// snapshot.
    pub fn exposed_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .positions
            .values()
            .filter(|p| p.is_open())
            .map(|p| p.symbol.clone())
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    /// Drop closed positions from the working set, returning them for
    /// archival.
    pub fn sweep_closed(&mut self) -> Vec<Position> {
        let closed_ids: Vec<String> = self
            .positions
            .values()
            .filter(|p| !p.is_open())
            .map(|p| p.id.clone())
            .collect();
        closed_ids
            .into_iter()
            .filter_map(|id| self.positions.remove(&id))
            .collect()
    }

    /// Counts by lifecycle status, for the status command.
    pub fn stats(&self) -> EngineStats {
        let mut stats = EngineStats::default();
        for position in self.positions.values() {
            match position.status {
                PositionStatus::Active => stats.active += 1,
                PositionStatus::PartiallyClosed => stats.partially_closed += 1,
                PositionStatus::TpClosed => stats.tp_closed += 1,
                PositionStatus::SlClosed => stats.sl_closed += 1,
                PositionStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}

/// Engine position counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub active: usize,
    pub partially_closed: usize,
    pub tp_closed: usize,
    pub sl_closed: usize,
    pub cancelled: usize,
}
