//! Best-effort webhook notifications.
//!
//! Delivery is fire-and-forget: failures are retried on a short backoff and
//! then logged as requiring reconciliation. A notification failure never
//! blocks or reverses the position transition that produced it.

use anyhow::{anyhow, Context, Result};
use backoff::ExponentialBackoff;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::ExecError;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// What happened to a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PositionOpened,
    DcaFilled,
    PartialTakeProfit,
    TakeProfit,
    StopLoss,
    TrailingStopFired,
    OcoExecuted,
    AutoClosed,
    ManualClosed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PositionOpened => "position_opened",
            EventKind::DcaFilled => "dca_filled",
            EventKind::PartialTakeProfit => "partial_take_profit",
            EventKind::TakeProfit => "take_profit",
            EventKind::StopLoss => "stop_loss",
            EventKind::TrailingStopFired => "trailing_stop_fired",
            EventKind::OcoExecuted => "oco_executed",
            EventKind::AutoClosed => "auto_closed",
            EventKind::ManualClosed => "manual_closed",
        }
    }
}

/// One outbound notification.
#[derive(Debug, Clone, Serialize)]
pub struct TradeEvent {
    pub kind: EventKind,
    pub owner_id: String,
    pub position_id: String,
    pub symbol: String,
    pub price: Option<Decimal>,
    pub pnl: Option<Decimal>,
    pub detail: serde_json::Value,
}

impl TradeEvent {
    pub fn new(
        kind: EventKind,
        owner_id: impl Into<String>,
        position_id: impl Into<String>,
        symbol: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            owner_id: owner_id.into(),
            position_id: position_id.into(),
            symbol: symbol.into(),
            price: None,
            pnl: None,
            detail: json!({}),
        }
    }

    pub fn with_price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_pnl(mut self, pnl: Decimal) -> Self {
        self.pnl = Some(pnl);
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Webhook notification sink. Cloneable so sends can be spawned off the
/// hot path.
#[derive(Clone)]
pub struct Notifier {
    client: Client,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            webhook_url,
        })
    }

    /// A sink that drops everything; used when no webhook is configured.
    pub fn disabled() -> Self {
        Self {
            client: Client::new(),
            webhook_url: None,
        }
    }

    fn retry_policy() -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(4),
            max_elapsed_time: Some(Duration::from_secs(8)),
            ..Default::default()
        }
    }

    /// Deliver one event, retrying transient failures. Exhausted retries
    /// log and return a reconciliation-required error; the caller's state
    /// transition already happened and stands.
    pub async fn send(&self, event: &TradeEvent) -> Result<(), ExecError> {
        let Some(url) = self.webhook_url.as_deref() else {
            debug!(kind = event.kind.as_str(), "notification sink disabled, dropping event");
            return Ok(());
        };

        let payload = json!({
            "event": event.kind.as_str(),
            "owner_id": event.owner_id,
            "position_id": event.position_id,
            "symbol": event.symbol,
            "price": event.price,
            "pnl": event.pnl,
            "detail": event.detail,
        });

        let client = &self.client;
        let payload_ref = &payload;
        let result = backoff::future::retry(Self::retry_policy(), || async move {
            let response = client
                .post(url)
                .json(payload_ref)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(anyhow!("webhook send failed: {e}")))?;

            let status = response.status();
            if status.is_server_error() {
                return Err(backoff::Error::transient(anyhow!(
                    "webhook returned {status}"
                )));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(anyhow!(
                    "webhook returned {status}"
                )));
            }
            Ok(())
        })
        .await;

        match result {
            Ok(()) => {
                debug!(kind = event.kind.as_str(), "notification delivered");
                Ok(())
            }
            Err(e) => {
                error!(
                    kind = event.kind.as_str(),
                    position_id = %event.position_id,
                    error = %e,
                    "notification delivery exhausted retries, reconciliation required"
                );
                Err(ExecError::ReconciliationRequired(format!(
                    "{} for {}: {e}",
                    event.kind.as_str(),
                    event.position_id
                )))
            }
        }
    }

    /// Fire-and-forget: spawn the send so the trading path never waits on
    /// the sink. Failures are already logged inside `send`.
    pub fn dispatch(&self, event: TradeEvent) {
        let notifier = self.clone();
        tokio::spawn(async move {
            let _ = notifier.send(&event).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_sink_drops_events_quietly() {
        let notifier = Notifier::disabled();
        let event = TradeEvent::new(EventKind::PositionOpened, "user-1", "pos-1", "BTCUSDT");
        // No webhook configured: returns immediately without error.
        assert!(notifier.send(&event).await.is_ok());
    }

    #[test]
    fn event_builder_sets_fields() {
        let event = TradeEvent::new(EventKind::StopLoss, "user-1", "pos-1", "BTCUSDT")
            .with_price(rust_decimal_macros::dec!(97))
            .with_pnl(rust_decimal_macros::dec!(-3))
            .with_detail(json!({"reason": "stop"}));

        assert_eq!(event.kind.as_str(), "stop_loss");
        assert!(event.price.is_some());
        assert_eq!(event.detail["reason"], "stop");
    }
}
