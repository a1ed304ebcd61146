//! Data models for positions, advanced orders, signals, and accounts.

mod account;
mod advanced;
mod position;
mod signal;

pub use account::{AccountProfile, AccountRegistry, DailyStats};
pub use advanced::{OcoOrder, OcoSide, OcoStatus, TrailingStop, TrailUpdate};
pub use position::{
    CloseOutcome, DcaLevel, DcaLevelStatus, Position, PositionSide, PositionStatus,
    TakeProfitTarget, TpHit,
};
pub use signal::TradeSignal;
