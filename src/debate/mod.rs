// =============================================================================
// Debate layer — role panel and orchestrator
// =============================================================================

pub mod orchestrator;
pub mod roles;

pub use orchestrator::{DebateError, DebateOrchestrator};
