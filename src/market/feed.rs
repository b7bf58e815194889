// =============================================================================
// Mark-Price Feed — venue stream in, supervisor ticks and WS prices out
// =============================================================================
//
// One reader task per connection forwards ticks over an unbounded channel in
// arrival order; the dispatcher on the other end drives, per tick:
//
//   1. the position supervisor (close intents go straight to the executor),
//   2. the throttled `prices` fan-out on /ws/market,
//   3. the price-threshold trigger on the callback bus (which typically
//      enqueues a manual debate).
//
// Because a single dispatcher consumes the channel, per-symbol tick order is
// preserved end to end.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::broadcast::BroadcastSink;
use crate::bus::{CallbackBus, ThresholdKind};
use crate::exec::{PositionSupervisor, TradeExecutor};
use crate::types::Symbol;

/// Reconnect delay after a stream error.
const RECONNECT_SECS: u64 = 5;
/// Minimum interval between `prices` fan-outs.
const PRICE_PUSH_SECS: u64 = 2;
/// Move from the reference price that fires the threshold trigger (percent).
const PRICE_TRIGGER_PCT: f64 = 2.0;

/// One mark-price observation.
#[derive(Debug, Clone)]
pub struct MarkTick {
    pub symbol: Symbol,
    pub price: f64,
    pub ts: i64,
}

/// Parse a combined-stream or direct mark-price frame.
pub fn parse_mark_tick(raw: &str) -> Option<MarkTick> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    // Combined streams wrap the payload in {"stream": ..., "data": ...}.
    let data = value.get("data").unwrap_or(&value);

    if data.get("e").and_then(|e| e.as_str()) != Some("markPriceUpdate") {
        return None;
    }
    let symbol = Symbol::parse(data.get("s")?.as_str()?)?;
    let price: f64 = data.get("p")?.as_str()?.parse().ok()?;
    if !price.is_finite() || price <= 0.0 {
        return None;
    }
    Some(MarkTick {
        symbol,
        price,
        ts: data.get("E").and_then(|v| v.as_i64()).unwrap_or(0),
    })
}

/// Run the venue mark-price stream until shutdown, reconnecting on errors.
pub async fn run_mark_stream(
    url: String,
    tx: mpsc::UnboundedSender<MarkTick>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        match stream_once(&url, &tx, &mut shutdown).await {
            Ok(()) => return,
            Err(e) => {
                error!(error = %e, "mark stream error — reconnecting in {RECONNECT_SECS}s");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(RECONNECT_SECS)) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn stream_once(
    url: &str,
    tx: &mpsc::UnboundedSender<MarkTick>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!("mark-price stream connecting");
    let (ws, _) = connect_async(url).await?;
    let (_, mut read) = ws.split();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("mark-price stream shutting down");
                return Ok(());
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(tick) = parse_mark_tick(&text) {
                            if tx.send(tick).is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        anyhow::bail!("mark stream closed by venue");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }
}

/// Consume ticks: supervisor triggers, price fan-out, threshold triggers.
pub async fn run_tick_dispatcher(
    mut rx: mpsc::UnboundedReceiver<MarkTick>,
    supervisor: Arc<PositionSupervisor>,
    executor: Arc<TradeExecutor>,
    bus: Arc<CallbackBus>,
    sink: Arc<BroadcastSink>,
    last_prices: Arc<parking_lot::RwLock<HashMap<Symbol, f64>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reference_prices: HashMap<Symbol, f64> = HashMap::new();
    let mut push_ticker = tokio::time::interval(Duration::from_secs(PRICE_PUSH_SECS));

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("tick dispatcher shutting down");
                return;
            }
            _ = push_ticker.tick() => {
                let prices = last_prices.read().clone();
                if !prices.is_empty() {
                    let data: serde_json::Map<String, serde_json::Value> = prices
                        .iter()
                        .map(|(s, p)| (s.raw().to_string(), serde_json::json!(p)))
                        .collect();
                    sink.publish_prices(serde_json::Value::Object(data)).await;
                }
            }
            tick = rx.recv() => {
                let Some(tick) = tick else {
                    info!("tick channel closed — dispatcher exiting");
                    return;
                };

                last_prices.write().insert(tick.symbol.clone(), tick.price);

                // ── Supervisor triggers ─────────────────────────────────
                let intents = supervisor.on_mark_price(&tick.symbol, tick.price, Utc::now());
                for intent in intents {
                    let outcome = executor.close_position(intent.clone()).await;
                    if let crate::exec::ExecuteOutcome::Failed(reason) = &outcome {
                        warn!(
                            symbol = %intent.symbol,
                            reason = %reason,
                            "supervised close failed"
                        );
                    }
                }

                // ── Price-threshold trigger ─────────────────────────────
                let reference = *reference_prices
                    .entry(tick.symbol.clone())
                    .or_insert(tick.price);
                if reference > 0.0 {
                    let move_pct = (tick.price - reference) / reference * 100.0;
                    if move_pct.abs() >= PRICE_TRIGGER_PCT {
                        let kind = if move_pct > 0.0 {
                            ThresholdKind::Surge
                        } else {
                            ThresholdKind::Drop
                        };
                        debug!(symbol = %tick.symbol, move_pct, %kind, "price threshold crossed");
                        reference_prices.insert(tick.symbol.clone(), tick.price);
                        bus.emit_price_trigger(tick.symbol.clone(), tick.price, kind).await;
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_combined_stream_frame() {
        let raw = r#"{
            "stream": "btcusdt@markPrice@1s",
            "data": {"e": "markPriceUpdate", "s": "BTCUSDT", "p": "50123.45", "E": 1700000000000}
        }"#;
        let tick = parse_mark_tick(raw).unwrap();
        assert_eq!(tick.symbol.raw(), "BTCUSDT");
        assert!((tick.price - 50123.45).abs() < 1e-9);
        assert_eq!(tick.ts, 1700000000000);
    }

    #[test]
    fn parses_direct_frame() {
        let raw = r#"{"e": "markPriceUpdate", "s": "ETHUSDT", "p": "2345.6", "E": 1}"#;
        let tick = parse_mark_tick(raw).unwrap();
        assert_eq!(tick.symbol.raw(), "ETHUSDT");
    }

    #[test]
    fn rejects_other_frames_and_bad_prices() {
        assert!(parse_mark_tick(r#"{"e": "aggTrade", "s": "BTCUSDT", "p": "1"}"#).is_none());
        assert!(parse_mark_tick(r#"{"e": "markPriceUpdate", "s": "BTCUSDT", "p": "-5"}"#).is_none());
        assert!(parse_mark_tick(r#"{"e": "markPriceUpdate", "s": "BTCUSDT", "p": "nan"}"#).is_none());
        assert!(parse_mark_tick("not json").is_none());
    }
}
