//! Trading logic: the position engine, safety rails, advanced orders, and
//! the orchestrator that wires them to the exchange.

pub mod advanced;
pub mod config;
pub mod engine;
pub mod orchestrator;
pub mod safety;

pub use advanced::{AdvancedOrderEvaluator, OcoFire, TrailingFire};
pub use config::{DcaConfig, DcaLevelConfig, RiskConfig, SafetyConfig, TpMode};
pub use engine::{EngineStats, PositionEngine};
pub use orchestrator::{ExecutionReport, Orchestrator};
pub use safety::{SafetyManager, SafetyVerdict, TradeOutcome};
