//! Orchestrator: drives the signal-to-execution pipeline, the DCA trigger
//! monitor, progressive take-profit targets, advanced orders, and
//! position closing against the exchange boundary.
//!
//! Ordering rule for every mutation that involves money: the exchange call
//! is confirmed first, engine state second, the store third, notifications
//! last. A failed exchange call aborts the action with engine state
//! untouched; a failed notification never rolls anything back.

use futures::future;
use rust_decimal::Decimal;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::ExecError;
use crate::exchange::{with_retry, CloseRequest, Exchange, ExchangeError, OrderTicket};
use crate::models::{
    AccountRegistry, CloseOutcome, OcoSide, PositionSide, PositionStatus, TradeSignal,
};
use crate::notify::{EventKind, Notifier, TradeEvent};
use crate::store::PositionStore;
use crate::trading::advanced::AdvancedOrderEvaluator;
use crate::trading::engine::PositionEngine;
use crate::trading::safety::SafetyManager;

/// Confirmed outcome of `execute_signal`.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub position_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub leverage: u32,
    pub order_id: String,
}

/// Which exit fired during a tick, decided before the exchange close.
#[derive(Debug, Clone, Copy)]
enum ExitKind {
    TakeProfit(crate::models::TpHit),
    StopLoss,
}

/// Central coordinator wiring the engine, safety rails, advanced orders,
/// exchange, store, and notifier. All collaborators are injected at
/// construction.
pub struct Orchestrator {
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn PositionStore>,
    safety: Arc<RwLock<SafetyManager>>,
    engine: Arc<RwLock<PositionEngine>>,
    accounts: Arc<RwLock<AccountRegistry>>,
    advanced: Arc<RwLock<AdvancedOrderEvaluator>>,
    notifier: Notifier,
}

impl Orchestrator {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        store: Arc<dyn PositionStore>,
        safety: Arc<RwLock<SafetyManager>>,
        accounts: Arc<RwLock<AccountRegistry>>,
        notifier: Notifier,
    ) -> Self {
        Self {
            exchange,
            store,
            safety,
            engine: Arc::new(RwLock::new(PositionEngine::new())),
            accounts,
            advanced: Arc::new(RwLock::new(AdvancedOrderEvaluator::new())),
            notifier,
        }
    }

    pub fn engine(&self) -> Arc<RwLock<PositionEngine>> {
        self.engine.clone()
    }

    pub fn safety(&self) -> Arc<RwLock<SafetyManager>> {
        self.safety.clone()
    }

    pub fn accounts(&self) -> Arc<RwLock<AccountRegistry>> {
        self.accounts.clone()
    }

    pub fn advanced(&self) -> Arc<RwLock<AdvancedOrderEvaluator>> {
        self.advanced.clone()
    }

    pub fn store(&self) -> Arc<dyn PositionStore> {
        self.store.clone()
    }

    /// Load every open position from the store into the engine. Called at
    /// startup so independent schedulers resume against the same state.
    pub async fn restore_from_store(&self) -> anyhow::Result<usize> {
        let positions = self.store.list_active().await?;
        let count = positions.len();
        let mut engine = self.engine.write().await;
        for position in positions {
            engine.adopt(position);
        }
        if count > 0 {
            info!(count, "restored open positions from store");
        }
        Ok(count)
    }

    /// Deterministic idempotency key: a pure function of the signal
    /// context, so identical retries collide and replays are rejected.
    pub fn idempotency_key(
        owner_id: &str,
        symbol: &str,
        side: PositionSide,
        price: Decimal,
        quantity: Decimal,
    ) -> String {
        let payload = format!(
            "{owner_id}:{symbol}:{}:{price:.2}:{quantity:.6}",
            side.as_str()
        );
        let digest = Sha256::digest(payload.as_bytes());
        format!("{symbol}_{}", &hex::encode(digest)[..12])
    }

    /// One consistent price snapshot for every symbol with open exposure.
    /// Quotes are fetched concurrently, but all decisions within a tick see
    /// this single view.
    pub async fn price_snapshot(&self) -> HashMap<String, Decimal> {
        let symbols = { self.engine.read().await.exposed_symbols() };
        let quotes = future::join_all(symbols.iter().map(|symbol| async move {
            (symbol.clone(), self.exchange.get_price(symbol).await)
        }))
        .await;

        let mut prices = HashMap::new();
        for (symbol, quote) in quotes {
            match quote {
                Ok(Some(price)) => {
                    prices.insert(symbol, price);
                }
                Ok(None) => debug!(symbol = %symbol, "no quote for snapshot"),
                Err(e) => warn!(symbol = %symbol, error = %e, "price fetch failed"),
            }
        }
        prices
    }

    // ==================== Signal execution ====================

    /// Ordered, fail-closed pipeline from a validated signal to a persisted
    /// position. Nothing is committed unless the exchange confirms the base
    /// fill; any check short-circuits with a structured error.
    pub async fn execute_signal(
        &self,
        owner_id: &str,
        signal: &TradeSignal,
    ) -> Result<ExecutionReport, ExecError> {
        // Profile and strategy gate. Leverage is capped here, not rejected.
        let (risk, dca, allowlist, denylist, exchange_enabled, leverage) = {
            let accounts = self.accounts.read().await;
            let profile = accounts
                .get(owner_id)
                .ok_or_else(|| ExecError::Validation(format!("unknown account {owner_id}")))?;
            if !profile.strategy_enabled {
                return Err(ExecError::Validation("strategy not enabled".into()));
            }
            (
                profile.risk.clone(),
                profile.dca.clone(),
                profile.symbol_allowlist.clone(),
                profile.symbol_denylist.clone(),
                profile.exchange_enabled,
                profile.capped_leverage(signal.leverage),
            )
        };
        dca.validate()
            .map_err(|e| ExecError::Validation(e.to_string()))?;

        // Global safety gate.
        {
            let mut safety = self.safety.write().await;
            let verdict = safety.trading_allowed();
            if !verdict.allowed {
                return Err(ExecError::SafetyBlocked(verdict.reason));
            }
        }

        // Concurrent position cap.
        let open = self.store.list_active_for(owner_id).await?;
        if open.len() >= risk.max_concurrent_positions {
            return Err(ExecError::SafetyBlocked(format!(
                "max concurrent positions reached: {}",
                risk.max_concurrent_positions
            )));
        }

        if !exchange_enabled {
            return Err(ExecError::Validation("no active exchange account".into()));
        }

        // Symbol and leverage bounds.
        {
            let safety = self.safety.read().await;
            let verdict =
                safety.validate_symbol(&signal.symbol, allowlist.as_deref(), &denylist);
            if !verdict.allowed {
                return Err(ExecError::Validation(verdict.reason));
            }
        }
        {
            let safety = self.safety.read().await;
            let verdict = safety.validate_leverage(leverage, risk.leverage_cap);
            if !verdict.allowed {
                return Err(ExecError::Validation(verdict.reason));
            }
        }

        // Balance, with the configured fallback when the call fails.
        let balance = self
            .exchange
            .account_balance()
            .await
            .unwrap_or(risk.fallback_balance);

        // Daily limits.
        {
            let mut accounts = self.accounts.write().await;
            if let Some(profile) = accounts.get_mut(owner_id) {
                if !profile.can_trade_today(balance) {
                    return Err(ExecError::SafetyBlocked(
                        "daily trading limits exceeded".into(),
                    ));
                }
            }
        }

        // Order size bounds.
        {
            let safety = self.safety.read().await;
            let verdict = safety.validate_order_size(
                dca.base_order_size,
                risk.min_order_size,
                risk.max_order_size,
            );
            if !verdict.allowed {
                return Err(ExecError::Validation(verdict.reason));
            }
        }

        // Entry price: signal price or live market.
        let entry_price = match signal.entry_price {
            Some(price) => price,
            None => with_retry("get_price", || self.exchange.get_price(&signal.symbol))
                .await?
                .ok_or_else(|| {
                    ExecError::Exchange(ExchangeError::PriceUnavailable(signal.symbol.clone()))
                })?,
        };

        // Idempotent base order.
        let quantity = dca.base_order_size / entry_price;
        let key =
            Self::idempotency_key(owner_id, &signal.symbol, signal.side, entry_price, quantity);
        {
            let mut safety = self.safety.write().await;
            if !safety.check_order_idempotency(&key) {
                return Err(ExecError::DuplicateOrder(key));
            }
        }

        let ticket = OrderTicket {
            symbol: signal.symbol.clone(),
            side: signal.side,
            quantity,
            price: entry_price,
            leverage,
            idempotency_key: key,
        };
        let receipt = with_retry("place_order", || self.exchange.place_order(&ticket)).await?;

        // Only now does the position exist.
        let position = {
            let mut engine = self.engine.write().await;
            engine.create_position(
                owner_id,
                &signal.symbol,
                signal.side,
                receipt.filled_price,
                leverage,
                &dca,
                &signal.targets,
                signal.stop_loss,
            )
        };
        self.store.insert(&position).await?;

        // Configured trailing protection rides along from entry.
        if dca.trailing_enabled {
            let mut advanced = self.advanced.write().await;
            if let Err(e) = advanced.create_trailing_stop(
                &position,
                receipt.filled_price,
                Some(dca.trailing_callback_percent),
                None,
                None,
            ) {
                warn!(position_id = %position.id, error = %e, "trailing stop setup failed");
            }
        }

        {
            let mut accounts = self.accounts.write().await;
            if let Some(profile) = accounts.get_mut(owner_id) {
                profile.record_open();
            }
        }

        info!(
            position_id = %position.id,
            owner = owner_id,
            symbol = %signal.symbol,
            side = signal.side.as_str(),
            entry = %receipt.filled_price,
            leverage,
            "position opened"
        );
        self.notifier.dispatch(
            TradeEvent::new(
                EventKind::PositionOpened,
                owner_id,
                &position.id,
                &signal.symbol,
            )
            .with_price(receipt.filled_price)
            .with_detail(json!({
                "side": signal.side.as_str(),
                "leverage": leverage,
                "quantity": quantity.to_string(),
            })),
        );

        Ok(ExecutionReport {
            position_id: position.id,
            symbol: signal.symbol.clone(),
            side: signal.side,
            entry_price: receipt.filled_price,
            quantity,
            leverage,
            order_id: receipt.order_id,
        })
    }

    // ==================== DCA monitor ====================

    /// Arm and fill DCA levels for one position at the observed price.
    /// Fills are recorded strictly after exchange confirmation; a failed
    /// order leaves the level armed for the next tick.
    pub async fn process_dca_triggers(
        &self,
        position_id: &str,
        current_price: Decimal,
    ) -> Result<Vec<usize>, ExecError> {
        let mut filled = Vec::new();
        let mut snapshot = None;

        {
            let mut engine = self.engine.write().await;
            let Some(position) = engine.get_mut(position_id) else {
                return Ok(filled);
            };
            if !position.is_open() {
                return Ok(filled);
            }

            position.check_dca_triggers(current_price);
            let armed = position.triggered_levels();
            if armed.is_empty() {
                return Ok(filled);
            }

            for index in armed {
                let level = position.dca_levels[index].clone();
                let quantity = level.order_size / current_price;
                let key = Self::idempotency_key(
                    &position.owner_id,
                    &position.symbol,
                    position.side,
                    current_price,
                    quantity,
                );
                {
                    let mut safety = self.safety.write().await;
                    if !safety.check_order_idempotency(&key) {
                        debug!(key = %key, level = level.index, "duplicate DCA order skipped");
                        continue;
                    }
                }

                let ticket = OrderTicket {
                    symbol: position.symbol.clone(),
                    side: position.side,
                    quantity,
                    price: current_price,
                    leverage: position.leverage,
                    idempotency_key: key,
                };
                match with_retry("dca_order", || self.exchange.place_order(&ticket)).await {
                    Ok(receipt) => {
                        position.fill_level(index, receipt.filled_price, receipt.filled_qty);
                        filled.push(index);
                        info!(
                            position_id,
                            level = level.index,
                            price = %receipt.filled_price,
                            avg_entry = %position.avg_entry,
                            "DCA level filled"
                        );
                        self.notifier.dispatch(
                            TradeEvent::new(
                                EventKind::DcaFilled,
                                &position.owner_id,
                                position_id,
                                &position.symbol,
                            )
                            .with_price(receipt.filled_price)
                            .with_detail(json!({
                                "level": level.index,
                                "avg_entry": position.avg_entry.to_string(),
                            })),
                        );
                    }
                    Err(e) => {
                        warn!(
                            position_id,
                            level = level.index,
                            error = %e,
                            "DCA order failed, level stays armed"
                        );
                    }
                }
            }

            if !filled.is_empty() {
                snapshot = Some(position.clone());
            }
        }

        if let Some(position) = snapshot {
            self.store.update(&position).await?;
        }
        Ok(filled)
    }

    // ==================== Exit monitor ====================

    /// Evaluate take profit then stop loss for one position at the observed
    /// price. Returns the close outcome when an exit fired and was
    /// confirmed.
    pub async fn check_exits(
        &self,
        position_id: &str,
        current_price: Decimal,
    ) -> Result<Option<CloseOutcome>, ExecError> {
        let decision = {
            let engine = self.engine.read().await;
            let Some(position) = engine.get(position_id) else {
                return Ok(None);
            };
            if !position.is_open() {
                return Ok(None);
            }
            if let Some(hit) = position.check_take_profit(current_price) {
                Some((ExitKind::TakeProfit(hit), position.tp_close_qty(hit)))
            } else if position.check_stop_loss(current_price) {
                Some((ExitKind::StopLoss, position.remaining_qty))
            } else {
                None
            }
        };
        let Some((kind, quantity)) = decision else {
            return Ok(None);
        };

        let close = self
            .confirm_close(position_id, quantity, current_price)
            .await?;
        let Some(_receipt) = close else {
            return Ok(None);
        };

        let (outcome, owner_id, symbol, realized_total, event_kind) = {
            let mut engine = self.engine.write().await;
            let Some(position) = engine.get_mut(position_id) else {
                return Ok(None);
            };
            let outcome = match kind {
                ExitKind::TakeProfit(hit) => position.execute_take_profit(hit, current_price),
                ExitKind::StopLoss => position.execute_stop_loss(current_price),
            };
            let event_kind = match kind {
                ExitKind::TakeProfit(_) if outcome.fully_closed => EventKind::TakeProfit,
                ExitKind::TakeProfit(_) => EventKind::PartialTakeProfit,
                ExitKind::StopLoss => EventKind::StopLoss,
            };
            let snapshot = position.clone();
            self.store.update(&snapshot).await?;
            (
                outcome,
                snapshot.owner_id,
                snapshot.symbol,
                snapshot.realized_pnl,
                event_kind,
            )
        };

        if outcome.breakeven_promoted {
            info!(position_id, "stop loss promoted to breakeven");
        }
        info!(
            position_id,
            kind = ?event_kind,
            qty = %outcome.closed_qty,
            pnl = %outcome.pnl,
            fully_closed = outcome.fully_closed,
            "exit executed"
        );

        self.record_close(&owner_id, &outcome, realized_total).await;
        self.notifier.dispatch(
            TradeEvent::new(event_kind, &owner_id, position_id, &symbol)
                .with_price(current_price)
                .with_pnl(outcome.pnl),
        );
        Ok(Some(outcome))
    }

    /// One scheduler pass over every open position against a single price
    /// snapshot. `allow_new` gates DCA fills (new execution) while exits
    /// always run.
    pub async fn monitor_positions(
        &self,
        prices: &HashMap<String, Decimal>,
        allow_new: bool,
    ) {
        let ids = { self.engine.read().await.active_ids() };
        for id in ids {
            let symbol = {
                let engine = self.engine.read().await;
                match engine.get(&id) {
                    Some(p) => p.symbol.clone(),
                    None => continue,
                }
            };
            let Some(&price) = prices.get(&symbol) else {
                continue;
            };

            if allow_new {
                if let Err(e) = self.process_dca_triggers(&id, price).await {
                    if !e.is_benign() {
                        warn!(position_id = %id, error = %e, "DCA trigger pass failed");
                    }
                }
            }
            if let Err(e) = self.check_exits(&id, price).await {
                warn!(position_id = %id, error = %e, "exit pass failed");
            }
        }
    }

    // ==================== Progressive targets ====================

    /// Walk progressive take-profit targets for every open position.
    /// Targets are evaluated strictly in index order; only the first
    /// unreached target can fire per tick, and the final target closes the
    /// remainder.
    pub async fn monitor_targets(&self, prices: &HashMap<String, Decimal>) {
        let ids = { self.engine.read().await.active_ids() };
        for id in ids {
            if let Err(e) = self.check_next_target(&id, prices).await {
                if !e.is_benign() {
                    warn!(position_id = %id, error = %e, "target pass failed");
                }
            }
        }
    }

    async fn check_next_target(
        &self,
        position_id: &str,
        prices: &HashMap<String, Decimal>,
    ) -> Result<Option<CloseOutcome>, ExecError> {
        let decision = {
            let engine = self.engine.read().await;
            let Some(position) = engine.get(position_id) else {
                return Ok(None);
            };
            if !position.is_open() || position.targets.is_empty() {
                return Ok(None);
            }
            let Some(&price) = prices.get(&position.symbol) else {
                return Ok(None);
            };
            match position.next_target() {
                Some(target) if position.target_crossed(target, price) => {
                    Some((target.index, position.target_close_qty(target.index), price))
                }
                _ => None,
            }
        };
        let Some((target_index, quantity, price)) = decision else {
            return Ok(None);
        };

        let close = self.confirm_close(position_id, quantity, price).await?;
        if close.is_none() {
            return Ok(None);
        }

        let (outcome, owner_id, symbol, realized_total) = {
            let mut engine = self.engine.write().await;
            let Some(position) = engine.get_mut(position_id) else {
                return Ok(None);
            };
            let outcome = position.execute_target(target_index, price);
            let snapshot = position.clone();
            self.store.update(&snapshot).await?;
            (
                outcome,
                snapshot.owner_id,
                snapshot.symbol,
                snapshot.realized_pnl,
            )
        };

        let event_kind = if outcome.fully_closed {
            EventKind::TakeProfit
        } else {
            EventKind::PartialTakeProfit
        };
        info!(
            position_id,
            target = target_index,
            price = %price,
            qty = %outcome.closed_qty,
            pnl = %outcome.pnl,
            fully_closed = outcome.fully_closed,
            "target hit"
        );

        self.record_close(&owner_id, &outcome, realized_total).await;
        self.notifier.dispatch(
            TradeEvent::new(event_kind, &owner_id, position_id, &symbol)
                .with_price(price)
                .with_pnl(outcome.pnl)
                .with_detail(json!({ "target": target_index })),
        );
        Ok(Some(outcome))
    }

    // ==================== Advanced orders ====================

    /// Evaluate trailing stops and OCO orders against the snapshot,
    /// executing any fires through the normal confirmed-close path.
    pub async fn monitor_advanced(&self, prices: &HashMap<String, Decimal>) {
        let positions = { self.engine.read().await.positions().clone() };

        let trailing_fires = {
            let mut advanced = self.advanced.write().await;
            advanced.update_trailing_stops(prices, &positions)
        };
        for fire in trailing_fires {
            let result = self
                .close_position_with(
                    &fire.position_id,
                    None,
                    fire.current_price,
                    PositionStatus::SlClosed,
                    EventKind::TrailingStopFired,
                    json!({ "stop_price": fire.stop_price.to_string() }),
                )
                .await;
            if let Err(e) = result {
                warn!(
                    position_id = %fire.position_id,
                    error = %e,
                    "trailing stop close failed"
                );
            }
        }

        let oco_fires = {
            let mut advanced = self.advanced.write().await;
            advanced.check_oco_orders(prices, &positions)
        };
        for fire in oco_fires {
            let terminal = match fire.executed_side {
                OcoSide::TakeProfit => PositionStatus::TpClosed,
                OcoSide::StopLoss => PositionStatus::SlClosed,
            };
            let result = self
                .close_position_with(
                    &fire.position_id,
                    Some(fire.quantity),
                    fire.execution_price,
                    terminal,
                    EventKind::OcoExecuted,
                    json!({ "oco_id": fire.oco_id, "side": fire.executed_side.as_str() }),
                )
                .await;
            if let Err(e) = result {
                warn!(oco_id = %fire.oco_id, error = %e, "OCO close failed");
            }
        }

        self.advanced.write().await.sweep();
    }

    // ==================== Closing ====================

    /// Close every open position on a symbol for owners opted into
    /// auto-stop, at current market price. Returns the number closed.
    pub async fn auto_close_positions(
        &self,
        symbol: &str,
        reason: &str,
    ) -> Result<usize, ExecError> {
        let ids = { self.engine.read().await.active_ids_on_symbol(symbol) };
        if ids.is_empty() {
            return Ok(0);
        }

        let mut closed = 0;
        for id in ids {
            let owner_id = {
                let engine = self.engine.read().await;
                match engine.get(&id) {
                    Some(p) => p.owner_id.clone(),
                    None => continue,
                }
            };
            let opted_in = {
                let accounts = self.accounts.read().await;
                accounts
                    .get(&owner_id)
                    .map(|p| p.auto_stop_enabled)
                    .unwrap_or(false)
            };
            if !opted_in {
                debug!(position_id = %id, owner = %owner_id, "auto-stop not enabled, skipping");
                continue;
            }

            let price = match with_retry("get_price", || self.exchange.get_price(symbol)).await {
                Ok(Some(price)) => price,
                Ok(None) | Err(_) => {
                    warn!(position_id = %id, symbol, "no price for auto-close, skipping");
                    continue;
                }
            };

            match self
                .close_position_with(
                    &id,
                    None,
                    price,
                    PositionStatus::Cancelled,
                    EventKind::AutoClosed,
                    json!({ "reason": reason }),
                )
                .await
            {
                Ok(Some(outcome)) => {
                    info!(
                        position_id = %id,
                        reason,
                        pnl = %outcome.pnl,
                        "position auto-closed"
                    );
                    closed += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(position_id = %id, error = %e, "auto-close failed"),
            }
        }
        Ok(closed)
    }

    /// Manually close a position at current market price.
    pub async fn close_position(
        &self,
        position_id: &str,
        reason: &str,
    ) -> Result<CloseOutcome, ExecError> {
        let symbol = {
            let engine = self.engine.read().await;
            engine
                .get(position_id)
                .filter(|p| p.is_open())
                .map(|p| p.symbol.clone())
                .ok_or_else(|| {
                    ExecError::Validation(format!("position {position_id} not open"))
                })?
        };
        let price = with_retry("get_price", || self.exchange.get_price(&symbol))
            .await?
            .ok_or_else(|| ExecError::Exchange(ExchangeError::PriceUnavailable(symbol)))?;

        info!(position_id, reason, "manual close requested");
        self.close_position_with(
            position_id,
            None,
            price,
            PositionStatus::Cancelled,
            EventKind::ManualClosed,
            json!({ "reason": reason }),
        )
        .await?
        .ok_or_else(|| ExecError::Validation(format!("position {position_id} not open")))
    }

    /// Shared close path: confirm the exchange close, then apply the state
    /// transition, persist, record, and notify. `quantity: None` closes the
    /// whole remainder.
    async fn close_position_with(
        &self,
        position_id: &str,
        quantity: Option<Decimal>,
        exit_price: Decimal,
        terminal_status: PositionStatus,
        event_kind: EventKind,
        detail: serde_json::Value,
    ) -> Result<Option<CloseOutcome>, ExecError> {
        let close_qty = {
            let engine = self.engine.read().await;
            let Some(position) = engine.get(position_id).filter(|p| p.is_open()) else {
                return Ok(None);
            };
            quantity
                .unwrap_or(position.remaining_qty)
                .min(position.remaining_qty)
        };
        if close_qty.is_zero() {
            return Ok(None);
        }

        let close = self.confirm_close(position_id, close_qty, exit_price).await?;
        if close.is_none() {
            return Ok(None);
        }

        let (outcome, owner_id, symbol, realized_total) = {
            let mut engine = self.engine.write().await;
            let Some(position) = engine.get_mut(position_id) else {
                return Ok(None);
            };
            let outcome = position.close_partial(close_qty, exit_price, terminal_status);
            let snapshot = position.clone();
            self.store.update(&snapshot).await?;
            (
                outcome,
                snapshot.owner_id,
                snapshot.symbol,
                snapshot.realized_pnl,
            )
        };

        self.record_close(&owner_id, &outcome, realized_total).await;
        self.notifier.dispatch(
            TradeEvent::new(event_kind, &owner_id, position_id, &symbol)
                .with_price(exit_price)
                .with_pnl(outcome.pnl)
                .with_detail(detail),
        );
        Ok(Some(outcome))
    }

    /// Confirm a close on the exchange. Returns `Ok(None)` only when the
    /// position vanished between decision and execution.
    async fn confirm_close(
        &self,
        position_id: &str,
        quantity: Decimal,
        exit_price: Decimal,
    ) -> Result<Option<crate::exchange::CloseReceipt>, ExecError> {
        let request = {
            let engine = self.engine.read().await;
            let Some(position) = engine.get(position_id) else {
                return Ok(None);
            };
            CloseRequest {
                symbol: position.symbol.clone(),
                side: position.side,
                quantity,
                entry_price: position.avg_entry,
                exit_price,
                leverage: position.leverage,
            }
        };
        let receipt =
            with_retry("close_position", || self.exchange.close_position(&request)).await?;
        Ok(Some(receipt))
    }

    /// Fold a confirmed close into the owner's daily stats, and into the
    /// circuit-breaker window once the position is fully closed.
    async fn record_close(&self, owner_id: &str, outcome: &CloseOutcome, realized_total: Decimal) {
        let fallback = {
            let accounts = self.accounts.read().await;
            accounts
                .get(owner_id)
                .map(|p| p.risk.fallback_balance)
                .unwrap_or_default()
        };
        {
            let mut accounts = self.accounts.write().await;
            if let Some(profile) = accounts.get_mut(owner_id) {
                profile.record_close(outcome.pnl);
            }
        }
        if outcome.fully_closed {
            let balance = self.exchange.account_balance().await.unwrap_or(fallback);
            let mut safety = self.safety.write().await;
            safety.record_trade_result(realized_total, balance);
        }
    }
}
