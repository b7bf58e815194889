// =============================================================================
// Execution layer — risk gate, sizing, cooldowns, executor, supervisor
// =============================================================================

pub mod cooldown;
pub mod executor;
pub mod risk_gate;
pub mod sizing;
pub mod supervisor;

pub use cooldown::CooldownMap;
pub use executor::{ExecuteOutcome, TradeExecutor};
pub use supervisor::PositionSupervisor;
