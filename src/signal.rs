// =============================================================================
// Signal — the central artifact flowing from debate to executor and dashboard
// =============================================================================
//
// A Signal is assembled once at the end of a debate and never mutated. Every
// consumer (WebSocket feed, trade executor, REST surface, store) reads the
// same record.
//
// Invariants:
//   (a) `signal` is always one of the five closed values.
//   (b) `confidence` is clamped into [0, 100].
//   (c) at least one of `reason` / `final_raw_output` is non-empty.
//   (d) `role_opinions` is non-empty unless `error_text` is set.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::llm::ChatMessage;
use crate::types::{RiskLevel, SignalKind, Symbol};

// ---------------------------------------------------------------------------
// Role opinion
// ---------------------------------------------------------------------------

/// One analyst's verdict, created by the orchestrator and immutable
/// thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleOpinion {
    pub name: String,
    pub title: String,
    pub emoji: String,
    pub model_label: String,
    pub signal: SignalKind,
    /// Clamped into [0, 100] at construction.
    pub confidence: u8,
    /// Free-text analysis (or the error text for a synthetic HOLD).
    pub analysis: String,
    pub latency_ms: u64,
    /// The prompt actually sent to the model.
    pub input_messages: Vec<ChatMessage>,
}

impl RoleOpinion {
    /// Synthetic HOLD opinion standing in for a failed role call.
    pub fn synthetic_hold(
        name: &str,
        title: &str,
        emoji: &str,
        model_label: &str,
        error_text: String,
        latency_ms: u64,
        input_messages: Vec<ChatMessage>,
    ) -> Self {
        Self {
            name: name.to_string(),
            title: title.to_string(),
            emoji: emoji.to_string(),
            model_label: model_label.to_string(),
            signal: SignalKind::Hold,
            confidence: 0,
            analysis: error_text,
            latency_ms,
            input_messages,
        }
    }
}

// ---------------------------------------------------------------------------
// Stage timings
// ---------------------------------------------------------------------------

/// Wall-clock duration of each debate stage, in seconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StageTimestamps {
    pub fetch: f64,
    pub roles: f64,
    pub referee: f64,
    pub total: f64,
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// The fused output of one debate. Append-only once persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Monotonic id assigned by the store on insert (0 before persistence).
    pub id: i64,
    pub symbol: Symbol,
    /// RFC 3339 creation timestamp.
    pub created_at: String,

    pub signal: SignalKind,
    /// Clamped into [0, 100].
    pub confidence: u8,
    #[serde(default)]
    pub risk_level: RiskLevel,

    pub reason: String,
    #[serde(default)]
    pub risk_assessment: String,
    /// Raw referee output, kept for audit.
    #[serde(default)]
    pub final_raw_output: String,

    /// Role verdicts in role-name-sorted order.
    pub role_opinions: Vec<RoleOpinion>,
    #[serde(default)]
    pub role_input_messages: Vec<Vec<ChatMessage>>,
    #[serde(default)]
    pub final_input_messages: Vec<ChatMessage>,

    pub stage_timestamps: StageTimestamps,
    /// Mark price at the moment the signal was produced.
    pub price_at_signal: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_quote: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_text: Option<String>,
    /// Set when the signal was produced on a degraded path (partial role
    /// failure, referee fallback).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,

    /// True when the schema gate only recovered the record through its
    /// regex / Chinese-text fallback strategies.
    #[serde(default)]
    pub parsed_by_fallback: bool,
}

impl Signal {
    /// Validate the record-level invariants. Returns the violated invariant
    /// name on failure; used by the store before insert and by tests.
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        if self.confidence > 100 {
            return Err("confidence out of range");
        }
        if self.reason.is_empty() && self.final_raw_output.is_empty() {
            return Err("reason and final_raw_output both empty");
        }
        if self.role_opinions.is_empty() && self.error_text.is_none() {
            return Err("role_opinions empty without error_text");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Trade record
// ---------------------------------------------------------------------------

use crate::types::{PositionSide, Side, TradeStatus};

/// Exchange order lifecycle row. Append-only; status transitions monotonic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Venue order id (empty until the venue acknowledges).
    #[serde(default)]
    pub order_id: String,
    /// Our idempotency key, e.g. `signal:42`, `tp:42`, `sl:42`.
    pub client_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub position_side: PositionSide,
    pub price: f64,
    pub qty: f64,
    pub status: TradeStatus,
    /// Open/close provenance: "signal BUY", "tp", "sl", "trailing",
    /// "timeout", "manual", "riskgate", "adverse-reversal".
    pub reason: String,
    #[serde(default)]
    pub pnl_usdt: f64,
    #[serde(default)]
    pub pnl_pct: f64,
    #[serde(default)]
    pub leverage: u32,
    pub opened_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<String>,
}

// =============================================================================
// Tests
// =============================================================================
