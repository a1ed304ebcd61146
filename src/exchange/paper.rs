//! Paper exchange: simulated order execution against an in-memory price
//! table, with margin-style balance accounting.
//!
//! No real connectivity lives here; this is the stand-in implementation of
//! the [`Exchange`](super::Exchange) boundary used for dry runs and tests.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::models::PositionSide;

use super::types::{CloseReceipt, CloseRequest, ExchangeError, OrderReceipt, OrderTicket};
use super::Exchange;

/// Simulated exchange with a settable price feed and virtual balance.
pub struct PaperExchange {
    prices: RwLock<HashMap<String, Decimal>>,
    balance: RwLock<Decimal>,
    /// When set, every call fails with a transport error (outage simulation)
    transport_down: AtomicBool,
}

impl PaperExchange {
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
            balance: RwLock::new(initial_balance),
            transport_down: AtomicBool::new(false),
        }
    }

    /// Seed or move the simulated price for a symbol.
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }

    /// Toggle a simulated outage.
    pub fn set_transport_down(&self, down: bool) {
        self.transport_down.store(down, Ordering::SeqCst);
    }

    fn check_transport(&self) -> Result<(), ExchangeError> {
        if self.transport_down.load(Ordering::SeqCst) {
            Err(ExchangeError::Transport("simulated outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn get_price(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
        self.check_transport()?;
        Ok(self.prices.read().await.get(symbol).copied())
    }

    async fn place_order(&self, ticket: &OrderTicket) -> Result<OrderReceipt, ExchangeError> {
        self.check_transport()?;

        let fill_price = self
            .prices
            .read()
            .await
            .get(&ticket.symbol)
            .copied()
            .unwrap_or(ticket.price);

        // Margin reserved for the fill.
        let cost = ticket.quantity * fill_price / Decimal::from(ticket.leverage.max(1));
        let mut balance = self.balance.write().await;
        if cost > *balance {
            return Err(ExchangeError::InsufficientBalance {
                needed: cost,
                available: *balance,
            });
        }
        *balance -= cost;

        let receipt = OrderReceipt {
            order_id: format!("paper-{}", Uuid::new_v4()),
            filled_price: fill_price,
            filled_qty: ticket.quantity,
        };
        info!(
            symbol = %ticket.symbol,
            side = ticket.side.as_str(),
            qty = %ticket.quantity,
            price = %fill_price,
            key = %ticket.idempotency_key,
            "paper order filled"
        );
        Ok(receipt)
    }

    async fn close_position(&self, request: &CloseRequest) -> Result<CloseReceipt, ExchangeError> {
        self.check_transport()?;

        let entry = request.entry_price;
        let exit = request.exit_price;
        let qty = request.quantity;
        let leverage = Decimal::from(request.leverage.max(1));

        let raw_return = if entry.is_zero() {
            Decimal::ZERO
        } else {
            match request.side {
                PositionSide::Long => (exit - entry) / entry,
                PositionSide::Short => (entry - exit) / entry,
            }
        };
        let pnl = raw_return * qty * entry;
        let pnl_percent = raw_return * Decimal::ONE_HUNDRED * leverage;

        // Release margin plus realized PnL.
        let margin = qty * entry / leverage;
        *self.balance.write().await += margin + pnl;

        info!(
            symbol = %request.symbol,
            side = request.side.as_str(),
            qty = %qty,
            pnl = %pnl,
            "paper position closed"
        );
        Ok(CloseReceipt {
            exit_price: exit,
            pnl,
            pnl_percent,
        })
    }

    async fn account_balance(&self) -> Result<Decimal, ExchangeError> {
        self.check_transport()?;
        Ok(*self.balance.read().await)
    }
}
