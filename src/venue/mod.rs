// =============================================================================
// Venue adapter — signed perp REST client, user-data stream, retry policy
// =============================================================================

pub mod client;
pub mod retry;
pub mod user_stream;

use serde::{Deserialize, Serialize};

use crate::types::{PositionSide, Side, Symbol};

pub use client::VenueClient;

/// Typed venue failure, classified for the executor's retry policy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VenueError {
    #[error("venue transport error: {0}")]
    Network(String),
    #[error("venue returned {status} (code {code:?}): {message}")]
    Http { status: u16, code: Option<i64>, message: String },
    #[error("venue response could not be parsed: {0}")]
    Parse(String),
}

/// Venue error codes with permanent semantics (margin, bad symbol, bad
/// order). Everything else on a 4xx is still permanent; 5xx/429/network is
/// retryable.
const PERMANENT_CODES: [i64; 4] = [
    -2019, // margin is insufficient
    -1121, // invalid symbol
    -4048, // symbol not in trading
    -2010, // order would immediately trigger / rejected
];

impl VenueError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, code, .. } => {
                if code.is_some_and(|c| PERMANENT_CODES.contains(&c)) {
                    return false;
                }
                *status == 429 || *status == 408 || *status >= 500
            }
            // Unparseable status: treated as retryable on first sight; the
            // executor escalates to permanent on the second consecutive one.
            Self::Parse(_) => true,
        }
    }
}

/// Acknowledgement for a placed / queried order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub position_side: PositionSide,
    /// NEW / FILLED / PARTIALLY_FILLED / CANCELED / REJECTED / EXPIRED.
    pub status: String,
    pub avg_price: f64,
    pub executed_qty: f64,
}

impl OrderAck {
    pub fn is_filled(&self) -> bool {
        self.status == "FILLED"
    }
}

/// One venue position row (computed at read time, never stored).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: Symbol,
    pub position_side: PositionSide,
    pub qty: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
}

/// Account balance for the quote asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub asset: String,
    pub balance: f64,
    pub available: f64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_5xx_are_retryable() {
        assert!(VenueError::Network("reset".into()).is_retryable());
        assert!(VenueError::Http { status: 503, code: None, message: String::new() }
            .is_retryable());
        assert!(VenueError::Http { status: 429, code: None, message: String::new() }
            .is_retryable());
    }

    #[test]
    fn semantic_4xx_is_permanent() {
        assert!(!VenueError::Http {
            status: 400,
            code: Some(-2019),
            message: "Margin is insufficient".into()
        }
        .is_retryable());
        assert!(!VenueError::Http { status: 400, code: None, message: "bad".into() }
            .is_retryable());
    }

    #[test]
    fn permanent_code_overrides_5xx_status() {
        assert!(!VenueError::Http {
            status: 500,
            code: Some(-1121),
            message: "Invalid symbol".into()
        }
        .is_retryable());
    }

    #[test]
    fn unparseable_status_starts_retryable() {
        assert!(VenueError::Parse("garbage".into()).is_retryable());
    }
}
