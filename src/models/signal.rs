//! Incoming trade signal consumed by the orchestrator.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::position::PositionSide;

/// A parsed trading signal: what to open, where, and how to exit.
///
/// Produced by an external signal source (out of scope here); the engine
/// only consumes the structured form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    /// Trading symbol (e.g. BTCUSDT)
    pub symbol: String,

    pub side: PositionSide,

    /// Entry price; market price is fetched when absent
    pub entry_price: Option<Decimal>,

    /// Requested leverage; capped to the account maximum
    pub leverage: u32,

    /// Explicit stop-loss price from the signal
    pub stop_loss: Option<Decimal>,

    /// Progressive take-profit targets, ascending for LONG and descending
    /// for SHORT
    pub targets: Vec<Decimal>,
}

impl TradeSignal {
    pub fn new(symbol: impl Into<String>, side: PositionSide) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            entry_price: None,
            leverage: 10,
            stop_loss: None,
            targets: Vec::new(),
        }
    }

    pub fn with_entry(mut self, price: Decimal) -> Self {
        self.entry_price = Some(price);
        self
    }

    pub fn with_leverage(mut self, leverage: u32) -> Self {
        self.leverage = leverage;
        self
    }

    pub fn with_stop_loss(mut self, price: Decimal) -> Self {
        self.stop_loss = Some(price);
        self
    }

    pub fn with_targets(mut self, targets: Vec<Decimal>) -> Self {
        self.targets = targets;
        self
    }
}
