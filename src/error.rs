//! Execution error taxonomy.
//!
//! Propagation policy:
//! - `Validation` and `SafetyBlocked` are rejected pre-execution and never retried.
//! - `Exchange` errors are retried locally (see [`crate::exchange::with_retry`])
//!   before surfacing; nothing is committed on failure.
//! - `DuplicateOrder` is a safe no-op: the same logical order was already
//!   placed within the idempotency window. Callers log and move on.
//! - `ReconciliationRequired` marks a committed state transition whose
//!   downstream notification could not be delivered; it is never rolled back.

use thiserror::Error;

use crate::exchange::ExchangeError;

/// Errors surfaced by the orchestrator's execution pipeline.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Bad symbol, leverage, order size, or configuration. Rejected before
    /// any exchange call.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Kill switch, circuit breaker, pause, or a daily limit blocked the
    /// action before execution.
    #[error("trading blocked: {0}")]
    SafetyBlocked(String),

    /// An exchange call failed after exhausting retries.
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    /// The idempotency key was already seen within the last 24 hours.
    #[error("duplicate order: {0}")]
    DuplicateOrder(String),

    /// A committed transition could not be reported downstream; manual
    /// follow-up is required.
    #[error("reconciliation required: {0}")]
    ReconciliationRequired(String),

    /// Storage or other internal failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ExecError {
    /// Duplicate orders are benign to callers: the original order stands.
    pub fn is_benign(&self) -> bool {
        matches!(self, ExecError::DuplicateOrder(_))
    }
}
