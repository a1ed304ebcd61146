//! The exchange boundary trait and the bounded retry wrapper every order
//! path goes through.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::types::{CloseReceipt, CloseRequest, ExchangeError, OrderReceipt, OrderTicket};

/// Total attempts per exchange call: 1 initial + 3 retries, waiting
/// 1s/2s/4s between attempts.
const MAX_ATTEMPTS: u32 = 4;
const INITIAL_DELAY: Duration = Duration::from_secs(1);

/// The exchange seam the orchestrator executes against. Real connectivity
/// lives behind this trait; the engine only sees confirmed receipts.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Current price for a symbol, `None` when the feed has no quote.
    async fn get_price(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError>;

    /// Place an order. A receipt means the fill is confirmed.
    async fn place_order(&self, ticket: &OrderTicket) -> Result<OrderReceipt, ExchangeError>;

    /// Close quantity against a known entry, returning the exchange's PnL.
    async fn close_position(&self, request: &CloseRequest) -> Result<CloseReceipt, ExchangeError>;

    /// Available account balance in quote currency.
    async fn account_balance(&self) -> Result<Decimal, ExchangeError>;
}

/// Run an exchange call with the fixed retry policy: 3 retries on
/// exponential backoff (1s/2s/4s). Terminal errors surface immediately;
/// exhausting retries surfaces the last error without any state committed.
pub async fn with_retry<T, Op, Fut>(label: &str, mut op: Op) -> Result<T, ExchangeError>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut delay = INITIAL_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                warn!(
                    op = label,
                    attempt,
                    error = %err,
                    retry_in_secs = delay.as_secs(),
                    "exchange call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_transport_errors_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ExchangeError::Transport("timeout".into()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_retries_and_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::Transport("down".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn terminal_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::Rejected("bad symbol".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
