// =============================================================================
// Market data layer — candles, snapshot provider, regime, mark-price feed
// =============================================================================

pub mod feed;
pub mod indicators;
pub mod regime;
pub mod snapshot;

use serde::{Deserialize, Serialize};

pub use regime::Regime;
pub use snapshot::{MarketSnapshot, SnapshotProvider};

/// A single OHLCV candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// One entry from the large-trade tape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LargeTrade {
    pub price: f64,
    pub qty: f64,
    /// True when the buyer was the aggressor.
    pub buyer_is_taker: bool,
    pub ts: i64,
}
