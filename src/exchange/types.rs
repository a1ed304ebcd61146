//! Wire types for the exchange boundary.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::PositionSide;

/// An order to be placed, carrying its idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTicket {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub leverage: u32,
    /// Deterministic key derived from the signal context; identical retries
    /// produce identical keys
    pub idempotency_key: String,
}

/// A confirmed order fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: String,
    pub filled_price: Decimal,
    pub filled_qty: Decimal,
}

/// A request to close (part of) a position at a known exit price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseRequest {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub leverage: u32,
}

/// A confirmed close with the exchange's PnL accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseReceipt {
    pub exit_price: Decimal,
    /// PnL in quote currency (margin-based, unleveraged)
    pub pnl: Decimal,
    /// Return on margin in percent, scaled by leverage
    pub pnl_percent: Decimal,
}

/// Exchange call failures, split into retryable and terminal classes.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// No price is available for the symbol
    #[error("price unavailable for {0}")]
    PriceUnavailable(String),

    /// The exchange refused the order; retrying will not help
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Not enough margin to cover the order
    #[error("insufficient balance: need {needed}, have {available}")]
    InsufficientBalance {
        needed: Decimal,
        available: Decimal,
    },

    /// Transport-level failure (timeout, connection, 5xx); safe to retry
    #[error("exchange request failed: {0}")]
    Transport(String),
}

impl ExchangeError {
    /// Only transport failures are worth retrying; rejections and balance
    /// shortfalls are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Transport(_))
    }
}
