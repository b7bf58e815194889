// =============================================================================
// Shared types used across the Quorum trading engine
// =============================================================================
//
// Symbol carries the three interconvertible instrument forms (raw / display /
// base). All persisted fields use the raw form; conversions are total over the
// valid symbol set and round-trip.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Quote assets the engine recognises. A raw symbol is `<BASE><QUOTE>`.
const KNOWN_QUOTES: [&str; 2] = ["USDT", "USDC"];

// ---------------------------------------------------------------------------
// Symbol
// ---------------------------------------------------------------------------

/// Exchange-normalised identifier for a perpetual futures instrument.
///
/// Internally stores the raw form (e.g. `BTCUSDT`); the display
/// (`BTC/USDT:USDT`) and base (`BTC`) forms are derived on demand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Parse a raw symbol like `BTCUSDT`. Rejects anything whose quote asset
    /// is unknown or whose base would be empty.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_uppercase();
        let quote = KNOWN_QUOTES.iter().find(|q| raw.ends_with(*q))?;
        if raw.len() <= quote.len() {
            return None;
        }
        Some(Self(raw))
    }

    /// Parse the display/slashed form `BTC/USDT:USDT` back into a symbol.
    pub fn parse_display(display: &str) -> Option<Self> {
        let (pair, settle) = display.split_once(':')?;
        let (base, quote) = pair.split_once('/')?;
        if quote != settle || base.is_empty() {
            return None;
        }
        if !KNOWN_QUOTES.contains(&quote) {
            return None;
        }
        Self::parse(&format!("{base}{quote}"))
    }

    /// Raw exchange form, e.g. `BTCUSDT`. This is the persisted form.
    pub fn raw(&self) -> &str {
        &self.0
    }

    /// Quote asset, e.g. `USDT`.
    pub fn quote(&self) -> &str {
        KNOWN_QUOTES
            .iter()
            .find(|q| self.0.ends_with(*q))
            .copied()
            .unwrap_or("USDT")
    }

    /// Base asset, e.g. `BTC`.
    pub fn base(&self) -> &str {
        &self.0[..self.0.len() - self.quote().len()]
    }

    /// Display/slashed form, e.g. `BTC/USDT:USDT`.
    pub fn display(&self) -> String {
        let quote = self.quote();
        format!("{}/{}:{}", self.base(), quote, quote)
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Signal kind
// ---------------------------------------------------------------------------

/// The closed set of directional signals a debate can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    /// Open long.
    #[serde(rename = "BUY")]
    Buy,
    /// Close long.
    #[serde(rename = "SELL")]
    Sell,
    /// Open short.
    #[serde(rename = "SHORT")]
    Short,
    /// Close short.
    #[serde(rename = "COVER")]
    Cover,
    /// No action.
    #[serde(rename = "HOLD")]
    Hold,
}

impl SignalKind {
    /// Normalise free-form LLM output ("buy", " BUY ", "long") to the closed
    /// set. Returns `None` for anything unrecognised.
    pub fn normalize(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" | "LONG" | "OPEN_LONG" => Some(Self::Buy),
            "SELL" | "CLOSE_LONG" => Some(Self::Sell),
            "SHORT" | "OPEN_SHORT" => Some(Self::Short),
            "COVER" | "CLOSE_SHORT" => Some(Self::Cover),
            "HOLD" | "WAIT" | "NEUTRAL" => Some(Self::Hold),
            _ => None,
        }
    }

    /// True for the four kinds that reach the trade executor.
    pub fn is_actionable(self) -> bool {
        !matches!(self, Self::Hold)
    }

    /// True for the two opening kinds.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Buy | Self::Short)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Short => "SHORT",
            Self::Cover => "COVER",
            Self::Hold => "HOLD",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Risk level
// ---------------------------------------------------------------------------

/// Referee-assigned risk label. Persisted verbatim in its Chinese form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    #[serde(rename = "低")]
    Low,
    #[serde(rename = "中")]
    Medium,
    #[serde(rename = "高")]
    High,
}

impl RiskLevel {
    /// Map free-form text to a level; anything unrecognised becomes `None`
    /// (callers default to `Medium`).
    pub fn normalize(s: &str) -> Option<Self> {
        match s.trim() {
            "低" | "low" | "LOW" | "Low" => Some(Self::Low),
            "中" | "medium" | "MEDIUM" | "Medium" | "mid" => Some(Self::Medium),
            "高" | "high" | "HIGH" | "High" => Some(Self::High),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "低",
            Self::Medium => "中",
            Self::High => "高",
        }
    }
}

impl Default for RiskLevel {
    fn default() -> Self {
        Self::Medium
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Order sides
// ---------------------------------------------------------------------------

/// Exchange order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Hedge-mode position side on the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl PositionSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }

    /// Order side that opens this position side.
    pub fn opening_side(self) -> Side {
        match self {
            Self::Long => Side::Buy,
            Self::Short => Side::Sell,
        }
    }

    /// Order side that closes this position side.
    pub fn closing_side(self) -> Side {
        match self {
            Self::Long => Side::Sell,
            Self::Short => Side::Buy,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Trade record status
// ---------------------------------------------------------------------------

/// Lifecycle status of a TradeRecord row. Transitions are monotonic:
/// pending -> {filled, partial, canceled, failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Pending,
    Filled,
    Partial,
    Canceled,
    Failed,
}

impl TradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Filled => "filled",
            Self::Partial => "partial",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        }
    }

    /// Whether `next` is a legal transition from `self`.
    pub fn can_transition_to(self, next: TradeStatus) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            // Terminal states never move.
            _ => false,
        }
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Debate trigger
// ---------------------------------------------------------------------------

/// What caused a debate to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateTrigger {
    Scheduled,
    Manual,
    PriceThreshold,
}

impl std::fmt::Display for DebateTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Manual => write!(f, "manual"),
            Self::PriceThreshold => write!(f, "price_threshold"),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine mode
// ---------------------------------------------------------------------------

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
