// =============================================================================
// Market Snapshot Provider — immutable debate input with single-flight fetch
// =============================================================================
//
// One snapshot per debate: OHLCV window, derived indicators, funding rate,
// open interest, large-trade tape, regime label, timestamp.
//
// Fetch discipline:
//   - Single-flight per symbol: concurrent debates for the same symbol
//     serialise on a per-symbol mutex; the loser finds a fresh cache entry
//     and reuses it instead of refetching.
//   - Entries older than the configured staleness window are refetched.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::Symbol;

use super::indicators::atr::atr_pct;
use super::indicators::bollinger::{bollinger_standard, Bollinger};
use super::indicators::kdj::{kdj_standard, Kdj};
use super::indicators::ma::ema;
use super::indicators::macd::{macd_standard, Macd};
use super::indicators::rsi::rsi;
use super::regime::{classify, Regime};
use super::{Candle, LargeTrade};

/// Number of candles fetched for the indicator window.
const CANDLE_LIMIT: u32 = 120;
/// Kline interval used for the debate snapshot.
const CANDLE_INTERVAL: &str = "15m";

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Derived indicator block carried by the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsi_14: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_signal: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_histogram: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boll_upper: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boll_middle: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boll_lower: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kdj_k: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kdj_d: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kdj_j: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atr_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema_21: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema_55: Option<f64>,
}

/// Immutable input to one debate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: Symbol,
    pub candles: Vec<Candle>,
    pub indicators: IndicatorSet,
    pub funding_rate: f64,
    pub open_interest: f64,
    pub large_trades: Vec<LargeTrade>,
    pub regime: Regime,
    pub mark_price: f64,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Data source seam
// ---------------------------------------------------------------------------

/// The venue-facing reads the provider needs; the venue REST adapter
/// implements this, tests substitute fixtures.
#[async_trait::async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_klines(&self, symbol: &Symbol, interval: &str, limit: u32)
        -> Result<Vec<Candle>>;
    async fn fetch_funding_rate(&self, symbol: &Symbol) -> Result<f64>;
    async fn fetch_open_interest(&self, symbol: &Symbol) -> Result<f64>;
    async fn fetch_mark_price(&self, symbol: &Symbol) -> Result<f64>;
    async fn fetch_large_trades(&self, symbol: &Symbol, limit: u32) -> Result<Vec<LargeTrade>>;
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

struct CacheEntry {
    snapshot: Arc<MarketSnapshot>,
    fetched_at: Instant,
}

/// Snapshot provider with per-symbol single-flight and staleness-based
/// refetch.
pub struct SnapshotProvider {
    source: Arc<dyn MarketDataSource>,
    stale_after: Duration,
    cache: Mutex<HashMap<Symbol, CacheEntry>>,
    /// Per-symbol fetch guards; holding one serialises fetches per symbol.
    flights: Mutex<HashMap<Symbol, Arc<tokio::sync::Mutex<()>>>>,
}

impl SnapshotProvider {
    pub fn new(source: Arc<dyn MarketDataSource>, stale_after: Duration) -> Self {
        Self {
            source,
            stale_after,
            cache: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Get a fresh snapshot for `symbol`, sharing any in-flight fetch.
    pub async fn get(&self, symbol: &Symbol) -> Result<Arc<MarketSnapshot>> {
        if let Some(snapshot) = self.cached(symbol) {
            return Ok(snapshot);
        }

        let guard = {
            let mut flights = self.flights.lock();
            flights
                .entry(symbol.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _flight = guard.lock().await;

        // A concurrent caller may have fetched while we waited for the guard.
        if let Some(snapshot) = self.cached(symbol) {
            debug!(symbol = %symbol, "snapshot fetch joined in-flight result");
            return Ok(snapshot);
        }

        let snapshot = Arc::new(self.fetch(symbol).await?);
        self.cache.lock().insert(
            symbol.clone(),
            CacheEntry { snapshot: snapshot.clone(), fetched_at: Instant::now() },
        );
        Ok(snapshot)
    }

    fn cached(&self, symbol: &Symbol) -> Option<Arc<MarketSnapshot>> {
        let cache = self.cache.lock();
        let entry = cache.get(symbol)?;
        (entry.fetched_at.elapsed() < self.stale_after).then(|| entry.snapshot.clone())
    }

    async fn fetch(&self, symbol: &Symbol) -> Result<MarketSnapshot> {
        let started = Instant::now();

        let candles = self
            .source
            .fetch_klines(symbol, CANDLE_INTERVAL, CANDLE_LIMIT)
            .await
            .context("snapshot kline fetch")?;
        if candles.is_empty() {
            anyhow::bail!("no candles returned for {symbol}");
        }

        let funding_rate = self.source.fetch_funding_rate(symbol).await.unwrap_or(0.0);
        let open_interest = self.source.fetch_open_interest(symbol).await.unwrap_or(0.0);
        let large_trades = self
            .source
            .fetch_large_trades(symbol, 20)
            .await
            .unwrap_or_default();
        let mark_price = self
            .source
            .fetch_mark_price(symbol)
            .await
            .context("snapshot mark price fetch")?;

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
        let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();

        let macd = macd_standard(&closes);
        let boll: Option<Bollinger> = bollinger_standard(&closes);
        let kdj: Option<Kdj> = kdj_standard(&highs, &lows, &closes);

        let indicators = IndicatorSet {
            rsi_14: rsi(&closes, 14),
            macd: macd.as_ref().map(|m: &Macd| m.macd),
            macd_signal: macd.as_ref().map(|m| m.signal),
            macd_histogram: macd.as_ref().map(|m| m.histogram),
            boll_upper: boll.as_ref().map(|b| b.upper),
            boll_middle: boll.as_ref().map(|b| b.middle),
            boll_lower: boll.as_ref().map(|b| b.lower),
            kdj_k: kdj.as_ref().map(|k| k.k),
            kdj_d: kdj.as_ref().map(|k| k.d),
            kdj_j: kdj.as_ref().map(|k| k.j),
            atr_pct: atr_pct(&highs, &lows, &closes, 14),
            ema_21: ema(&closes, 21),
            ema_55: ema(&closes, 55),
        };

        let regime = classify(&closes);

        debug!(
            symbol = %symbol,
            candles = candles.len(),
            regime = %regime,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "market snapshot built"
        );

        Ok(MarketSnapshot {
            symbol: symbol.clone(),
            candles,
            indicators,
            funding_rate,
            open_interest,
            large_trades,
            regime,
            mark_price,
            created_at: Utc::now().to_rfc3339(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixtureSource {
        fetches: AtomicU32,
    }

    #[async_trait::async_trait]
    impl MarketDataSource for FixtureSource {
        async fn fetch_klines(
            &self,
            _symbol: &Symbol,
            _interval: &str,
            limit: u32,
        ) -> Result<Vec<Candle>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok((0..limit as i64)
                .map(|i| {
                    let close = 100.0 + i as f64 * 0.1;
                    Candle {
                        open_time: i * 60_000,
                        open: close - 0.05,
                        high: close + 0.2,
                        low: close - 0.2,
                        close,
                        volume: 10.0,
                    }
                })
                .collect())
        }

        async fn fetch_funding_rate(&self, _symbol: &Symbol) -> Result<f64> {
            Ok(0.0001)
        }

        async fn fetch_open_interest(&self, _symbol: &Symbol) -> Result<f64> {
            Ok(12_345.0)
        }

        async fn fetch_mark_price(&self, _symbol: &Symbol) -> Result<f64> {
            Ok(111.9)
        }

        async fn fetch_large_trades(&self, _symbol: &Symbol, _limit: u32) -> Result<Vec<LargeTrade>> {
            Ok(vec![])
        }
    }

    fn provider(stale_after: Duration) -> SnapshotProvider {
        SnapshotProvider::new(
            Arc::new(FixtureSource { fetches: AtomicU32::new(0) }),
            stale_after,
        )
    }

    #[tokio::test]
    async fn snapshot_carries_indicators_and_regime() {
        let p = provider(Duration::from_secs(60));
        let symbol = Symbol::parse("BTCUSDT").unwrap();
        let snap = p.get(&symbol).await.unwrap();

        assert_eq!(snap.symbol, symbol);
        assert_eq!(snap.candles.len(), 120);
        assert!(snap.indicators.rsi_14.is_some());
        assert!(snap.indicators.macd.is_some());
        assert!(snap.indicators.kdj_k.is_some());
        assert!(snap.indicators.atr_pct.is_some());
        assert!((snap.mark_price - 111.9).abs() < 1e-9);
        assert!((snap.funding_rate - 0.0001).abs() < 1e-12);
    }

    #[tokio::test]
    async fn fresh_cache_entry_is_reused() {
        let source = Arc::new(FixtureSource { fetches: AtomicU32::new(0) });
        let p = SnapshotProvider::new(source.clone(), Duration::from_secs(60));
        let symbol = Symbol::parse("ETHUSDT").unwrap();

        let a = p.get(&symbol).await.unwrap();
        let b = p.get(&symbol).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_cache_entry_is_refetched() {
        let source = Arc::new(FixtureSource { fetches: AtomicU32::new(0) });
        let p = SnapshotProvider::new(source.clone(), Duration::from_millis(1));
        let symbol = Symbol::parse("ETHUSDT").unwrap();

        let _ = p.get(&symbol).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _ = p.get(&symbol).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let source = Arc::new(FixtureSource { fetches: AtomicU32::new(0) });
        let p = Arc::new(SnapshotProvider::new(source.clone(), Duration::from_secs(60)));
        let symbol = Symbol::parse("BTCUSDT").unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let p = p.clone();
            let s = symbol.clone();
            handles.push(tokio::spawn(async move { p.get(&s).await.unwrap() }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }
}
