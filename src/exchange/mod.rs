//! Exchange boundary: the trait the orchestrator executes against, wire
//! types, the retry wrapper, and the paper implementation.

mod client;
mod paper;
mod types;

pub use client::{with_retry, Exchange};
pub use paper::PaperExchange;
pub use types::{CloseReceipt, CloseRequest, ExchangeError, OrderReceipt, OrderTicket};
