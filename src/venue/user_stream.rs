// =============================================================================
// User-Data Stream — order fills and account changes from the venue
// =============================================================================
//
// Maintains a listen key (created at connect, kept alive every 30 minutes)
// and forwards normalised events into the engine: symbols in raw form,
// numeric fields parsed from the venue's decimal strings.
//
// The reader forwards events in arrival order over an unbounded channel; the
// dispatcher on the other end feeds the position supervisor and broadcast
// sink.
// =============================================================================

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::types::{PositionSide, Side, Symbol};

use super::VenueClient;

/// Listen-key keepalive cadence (venue expires keys after 60 minutes).
const KEEPALIVE_SECS: u64 = 1800;
/// Reconnect delay after a stream error.
const RECONNECT_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Order lifecycle change pushed by the venue.
#[derive(Debug, Clone)]
pub struct OrderUpdateEvent {
    pub symbol: Symbol,
    pub client_id: String,
    pub order_id: String,
    pub side: Side,
    pub position_side: PositionSide,
    /// NEW / FILLED / PARTIALLY_FILLED / CANCELED / REJECTED / EXPIRED.
    pub status: String,
    pub avg_price: f64,
    pub cumulative_qty: f64,
    pub realized_pnl: f64,
    pub reduce_only: bool,
    pub ts: i64,
}

/// Wallet / position deltas pushed by the venue.
#[derive(Debug, Clone)]
pub struct AccountUpdateEvent {
    /// (asset, wallet_balance) pairs.
    pub balances: Vec<(String, f64)>,
    /// (symbol, side, qty, entry_price) rows; qty 0 means flat.
    pub positions: Vec<(Symbol, PositionSide, f64, f64)>,
}

/// One normalised user-data event.
#[derive(Debug, Clone)]
pub enum UserDataEvent {
    OrderUpdate(OrderUpdateEvent),
    AccountUpdate(AccountUpdateEvent),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn str_f64(v: Option<&serde_json::Value>) -> f64 {
    v.and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .or_else(|| v.and_then(|v| v.as_f64()))
        .unwrap_or(0.0)
}

/// Parse one raw frame into an event. Returns `None` for frames the engine
/// does not consume (listen-key expiry warnings are logged by the caller).
pub fn parse_user_data_event(raw: &str) -> Option<UserDataEvent> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    match value.get("e").and_then(|e| e.as_str())? {
        "ORDER_TRADE_UPDATE" => {
            let o = value.get("o")?;
            let symbol = Symbol::parse(o.get("s")?.as_str()?)?;
            let side = match o.get("S").and_then(|v| v.as_str()) {
                Some("SELL") => Side::Sell,
                _ => Side::Buy,
            };
            let position_side = match o.get("ps").and_then(|v| v.as_str()) {
                Some("SHORT") => PositionSide::Short,
                _ => PositionSide::Long,
            };
            Some(UserDataEvent::OrderUpdate(OrderUpdateEvent {
                symbol,
                client_id: o.get("c").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                order_id: o.get("i").map(|v| v.to_string()).unwrap_or_default(),
                side,
                position_side,
                status: o.get("X").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                avg_price: str_f64(o.get("ap")),
                cumulative_qty: str_f64(o.get("z")),
                realized_pnl: str_f64(o.get("rp")),
                reduce_only: o.get("R").and_then(|v| v.as_bool()).unwrap_or(false),
                ts: value.get("T").and_then(|v| v.as_i64()).unwrap_or(0),
            }))
        }
        "ACCOUNT_UPDATE" => {
            let a = value.get("a")?;
            let balances = a
                .get("B")
                .and_then(|b| b.as_array())
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| {
                            let asset = row.get("a")?.as_str()?.to_string();
                            Some((asset, str_f64(row.get("wb"))))
                        })
                        .collect()
                })
                .unwrap_or_default();
            let positions = a
                .get("P")
                .and_then(|p| p.as_array())
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| {
                            let symbol = Symbol::parse(row.get("s")?.as_str()?)?;
                            let side = match row.get("ps").and_then(|v| v.as_str()) {
                                Some("SHORT") => PositionSide::Short,
                                _ => PositionSide::Long,
                            };
                            let qty = str_f64(row.get("pa"));
                            Some((symbol, side, qty.abs(), str_f64(row.get("ep"))))
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(UserDataEvent::AccountUpdate(AccountUpdateEvent { balances, positions }))
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Stream loop
// ---------------------------------------------------------------------------

/// Run the user-data stream until shutdown, reconnecting on errors.
pub async fn run_user_stream(
    client: Arc<VenueClient>,
    tx: mpsc::UnboundedSender<UserDataEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        match stream_once(&client, &tx, &mut shutdown).await {
            Ok(()) => return, // clean shutdown
            Err(e) => {
                error!(error = %e, "user-data stream error — reconnecting in {RECONNECT_SECS}s");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_SECS)) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn stream_once(
    client: &Arc<VenueClient>,
    tx: &mpsc::UnboundedSender<UserDataEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listen_key = client.create_listen_key().await?;
    let url = client.user_stream_url(&listen_key);
    info!("user-data stream connecting");

    let (ws, _) = connect_async(&url).await?;
    let (_, mut read) = ws.split();

    let mut keepalive = tokio::time::interval(std::time::Duration::from_secs(KEEPALIVE_SECS));
    keepalive.tick().await; // immediate first tick consumed

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("user-data stream shutting down");
                return Ok(());
            }
            _ = keepalive.tick() => {
                if let Err(e) = client.keepalive_listen_key().await {
                    warn!(error = %e, "listen-key keepalive failed");
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match parse_user_data_event(&text) {
                            Some(event) => {
                                if tx.send(event).is_err() {
                                    // Receiver dropped — engine is shutting down.
                                    return Ok(());
                                }
                            }
                            None => debug!("unconsumed user-data frame"),
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        anyhow::bail!("user-data stream closed by venue");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
