// =============================================================================
// Venue REST Client — HMAC-SHA256 signed perp futures requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialised. All signed requests
// carry the API key header and a recvWindow of 5 000 ms to tolerate minor
// clock drift against the venue.
//
// Testnet vs. mainnet is a startup-time configuration choice; `from_env`
// hard-fails on ambiguous configuration rather than guessing which venue the
// operator meant.
// =============================================================================

use anyhow::Result;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::market::snapshot::MarketDataSource;
use crate::market::{Candle, LargeTrade};
use crate::types::{PositionSide, Side, Symbol};

use super::{AccountBalance, OrderAck, VenueError, VenuePosition};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

const MAINNET_REST: &str = "https://fapi.binance.com";
const MAINNET_WS: &str = "wss://fstream.binance.com";
const TESTNET_REST: &str = "https://testnet.binancefuture.com";
const TESTNET_WS: &str = "wss://stream.binancefuture.com";

/// Notional threshold above which an aggregate trade lands on the
/// large-trade tape (quote currency).
const LARGE_TRADE_NOTIONAL: f64 = 100_000.0;

/// Order parameters for `create_order`.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub position_side: PositionSide,
    /// MARKET / STOP_MARKET / TAKE_PROFIT_MARKET.
    pub order_type: String,
    pub qty: f64,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
    pub client_id: String,
}

/// Signed REST client for a USDT-margined perpetual futures venue.
#[derive(Clone)]
pub struct VenueClient {
    api_key: String,
    secret: String,
    base_url: String,
    ws_url: String,
    client: reqwest::Client,
}

impl VenueClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let (base_url, ws_url) = if testnet {
            (TESTNET_REST.to_string(), TESTNET_WS.to_string())
        } else {
            (MAINNET_REST.to_string(), MAINNET_WS.to_string())
        };

        info!(base_url = %base_url, testnet, "venue client initialised");

        Self { api_key, secret, base_url, ws_url, client }
    }

    /// Build from the environment. Hard-fails (startup abort) when the
    /// venue environment is unset or contradicts an explicit base URL.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("QUORUM_VENUE_API_KEY").unwrap_or_default();
        let secret = std::env::var("QUORUM_VENUE_API_SECRET").unwrap_or_default();

        let env = std::env::var("QUORUM_VENUE_ENV").unwrap_or_default();
        let testnet = match env.to_ascii_lowercase().as_str() {
            "testnet" => true,
            "mainnet" => false,
            other => anyhow::bail!(
                "QUORUM_VENUE_ENV must be 'testnet' or 'mainnet', got '{other}'"
            ),
        };

        if let Ok(explicit) = std::env::var("QUORUM_VENUE_BASE_URL") {
            let looks_testnet = explicit.contains("testnet");
            if looks_testnet != testnet {
                anyhow::bail!(
                    "ambiguous venue configuration: QUORUM_VENUE_ENV={env} but \
                     QUORUM_VENUE_BASE_URL={explicit}"
                );
            }
        }

        Ok(Self::new(api_key, secret, testnet))
    }

    /// WebSocket endpoint for the combined mark-price stream.
    pub fn mark_stream_url(&self, symbols: &[Symbol]) -> String {
        let streams: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@markPrice@1s", s.raw().to_lowercase()))
            .collect();
        format!("{}/stream?streams={}", self.ws_url, streams.join("/"))
    }

    /// WebSocket endpoint for the user-data stream under `listen_key`.
    pub fn user_stream_url(&self, listen_key: &str) -> String {
        format!("{}/ws/{}", self.ws_url, listen_key)
    }

    // -------------------------------------------------------------------------
    // Request signing
    // -------------------------------------------------------------------------

    /// Append `timestamp`, `recvWindow`, and the HMAC-SHA256 signature of
    /// the resulting query string. Every signed endpoint goes through here.
    fn signed_query(&self, params: &str) -> String {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis();

        let mut query = String::with_capacity(params.len() + 112);
        if !params.is_empty() {
            query.push_str(params);
            query.push('&');
        }
        query.push_str(&format!("timestamp={now_ms}&recvWindow={RECV_WINDOW}"));

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        query.push_str("&signature=");
        query.push_str(&hex::encode(mac.finalize().into_bytes()));
        query
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
    ) -> Result<serde_json::Value, VenueError> {
        let url = if query.is_empty() {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}{path}?{query}", self.base_url)
        };

        let resp = self
            .client
            .request(method, &url)
            .send()
            .await
            .map_err(|e| VenueError::Network(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| VenueError::Network(e.to_string()))?;

        if !status.is_success() {
            // Venue error payloads look like {"code": -2019, "msg": "..."}.
            let (code, message) = match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(v) => (
                    v.get("code").and_then(|c| c.as_i64()),
                    v.get("msg")
                        .and_then(|m| m.as_str())
                        .unwrap_or(&body)
                        .to_string(),
                ),
                Err(_) => (None, body.chars().take(200).collect()),
            };
            return Err(VenueError::Http { status: status.as_u16(), code, message });
        }

        serde_json::from_str(&body).map_err(|e| VenueError::Parse(e.to_string()))
    }

    // -------------------------------------------------------------------------
    // Account configuration
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/leverage — best-effort; failures are surfaced to the
    /// caller who logs them as warnings.
    pub async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<(), VenueError> {
        let params = format!("symbol={}&leverage={leverage}", symbol.raw());
        let qs = self.signed_query(&params);
        self.request(reqwest::Method::POST, "/fapi/v1/leverage", &qs)
            .await?;
        debug!(symbol = %symbol, leverage, "leverage set");
        Ok(())
    }

    /// POST /fapi/v1/marginType — `mode` is "cross" or "isolated".
    pub async fn set_margin_mode(&self, symbol: &Symbol, mode: &str) -> Result<(), VenueError> {
        let margin_type = if mode.eq_ignore_ascii_case("isolated") {
            "ISOLATED"
        } else {
            "CROSSED"
        };
        let params = format!("symbol={}&marginType={margin_type}", symbol.raw());
        let qs = self.signed_query(&params);
        match self
            .request(reqwest::Method::POST, "/fapi/v1/marginType", &qs)
            .await
        {
            Ok(_) => {
                debug!(symbol = %symbol, margin_type, "margin mode set");
                Ok(())
            }
            // "No need to change margin type" — venue already in the mode.
            Err(VenueError::Http { code: Some(-4046), .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/order — idempotent by `client_id`: resubmitting the same
    /// id yields the venue's duplicate-order rejection, which callers resolve
    /// via `query_order`.
    pub async fn create_order(&self, req: &OrderRequest) -> Result<OrderAck, VenueError> {
        let mut params = format!(
            "symbol={}&side={}&positionSide={}&type={}&quantity={}&newClientOrderId={}",
            req.symbol.raw(),
            req.side,
            req.position_side,
            req.order_type,
            req.qty,
            req.client_id,
        );
        if let Some(stop) = req.stop_price {
            params.push_str(&format!("&stopPrice={stop}"));
        }
        if req.reduce_only {
            params.push_str("&reduceOnly=true");
        }
        // Ask for the final state in the ack where possible.
        params.push_str("&newOrderRespType=RESULT");

        let qs = self.signed_query(&params);
        debug!(symbol = %req.symbol, side = %req.side, qty = req.qty,
               client_id = %req.client_id, order_type = %req.order_type, "placing order");

        let body = self
            .request(reqwest::Method::POST, "/fapi/v1/order", &qs)
            .await?;
        Self::parse_order_ack(&body)
    }

    /// DELETE /fapi/v1/order by client id.
    pub async fn cancel_order(&self, symbol: &Symbol, client_id: &str) -> Result<(), VenueError> {
        let params = format!("symbol={}&origClientOrderId={client_id}", symbol.raw());
        let qs = self.signed_query(&params);
        self.request(reqwest::Method::DELETE, "/fapi/v1/order", &qs)
            .await?;
        debug!(symbol = %symbol, client_id, "order canceled");
        Ok(())
    }

    /// GET /fapi/v1/order by client id (startup reconciliation).
    pub async fn query_order(
        &self,
        symbol: &Symbol,
        client_id: &str,
    ) -> Result<Option<OrderAck>, VenueError> {
        let params = format!("symbol={}&origClientOrderId={client_id}", symbol.raw());
        let qs = self.signed_query(&params);
        match self.request(reqwest::Method::GET, "/fapi/v1/order", &qs).await {
            Ok(body) => Self::parse_order_ack(&body).map(Some),
            // -2013: order does not exist.
            Err(VenueError::Http { code: Some(-2013), .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// GET /fapi/v1/openOrders, optionally per symbol.
    pub async fn open_orders(&self, symbol: Option<&Symbol>) -> Result<Vec<OrderAck>, VenueError> {
        let params = match symbol {
            Some(s) => format!("symbol={}", s.raw()),
            None => String::new(),
        };
        let qs = self.signed_query(&params);
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/openOrders", &qs)
            .await?;

        let rows = body
            .as_array()
            .ok_or_else(|| VenueError::Parse("openOrders is not an array".to_string()))?;
        let mut orders = Vec::with_capacity(rows.len());
        for row in rows {
            orders.push(Self::parse_order_ack(row)?);
        }
        Ok(orders)
    }

    fn parse_order_ack(body: &serde_json::Value) -> Result<OrderAck, VenueError> {
        let parse_fail = |what: &str| VenueError::Parse(format!("order ack missing {what}"));

        let raw_symbol = body
            .get("symbol")
            .and_then(|v| v.as_str())
            .ok_or_else(|| parse_fail("symbol"))?;
        let symbol = Symbol::parse(raw_symbol).ok_or_else(|| parse_fail("valid symbol"))?;

        let side = match body.get("side").and_then(|v| v.as_str()) {
            Some("BUY") => Side::Buy,
            Some("SELL") => Side::Sell,
            _ => return Err(parse_fail("side")),
        };
        let position_side = match body.get("positionSide").and_then(|v| v.as_str()) {
            Some("LONG") => PositionSide::Long,
            Some("SHORT") => PositionSide::Short,
            _ => return Err(parse_fail("positionSide")),
        };

        let status = body
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| parse_fail("status"))?
            .to_string();

        Ok(OrderAck {
            order_id: body
                .get("orderId")
                .map(|v| v.to_string())
                .unwrap_or_default(),
            client_id: body
                .get("clientOrderId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            symbol,
            side,
            position_side,
            status,
            avg_price: parse_str_f64(body.get("avgPrice")).unwrap_or(0.0),
            executed_qty: parse_str_f64(body.get("executedQty")).unwrap_or(0.0),
        })
    }

    // -------------------------------------------------------------------------
    // Account state
    // -------------------------------------------------------------------------

    /// GET /fapi/v2/positionRisk — non-flat positions only.
    pub async fn fetch_positions(&self) -> Result<Vec<VenuePosition>, VenueError> {
        let qs = self.signed_query("");
        let body = self
            .request(reqwest::Method::GET, "/fapi/v2/positionRisk", &qs)
            .await?;

        let rows = body
            .as_array()
            .ok_or_else(|| VenueError::Parse("positionRisk is not an array".to_string()))?;

        let mut positions = Vec::new();
        for row in rows {
            let qty = parse_str_f64(row.get("positionAmt")).unwrap_or(0.0);
            if qty == 0.0 {
                continue;
            }
            let Some(symbol) = row
                .get("symbol")
                .and_then(|v| v.as_str())
                .and_then(Symbol::parse)
            else {
                warn!("skipping position row with unparseable symbol");
                continue;
            };
            let position_side = match row.get("positionSide").and_then(|v| v.as_str()) {
                Some("SHORT") => PositionSide::Short,
                _ => PositionSide::Long,
            };
            positions.push(VenuePosition {
                symbol,
                position_side,
                qty: qty.abs(),
                entry_price: parse_str_f64(row.get("entryPrice")).unwrap_or(0.0),
                mark_price: parse_str_f64(row.get("markPrice")).unwrap_or(0.0),
                unrealized_pnl: parse_str_f64(row.get("unRealizedProfit")).unwrap_or(0.0),
                leverage: parse_str_f64(row.get("leverage")).unwrap_or(1.0) as u32,
            });
        }

        debug!(count = positions.len(), "positions fetched");
        Ok(positions)
    }

    /// GET /fapi/v2/balance — USDT row.
    pub async fn fetch_balance(&self) -> Result<AccountBalance, VenueError> {
        let qs = self.signed_query("");
        let body = self
            .request(reqwest::Method::GET, "/fapi/v2/balance", &qs)
            .await?;

        let rows = body
            .as_array()
            .ok_or_else(|| VenueError::Parse("balance is not an array".to_string()))?;

        for row in rows {
            if row.get("asset").and_then(|v| v.as_str()) == Some("USDT") {
                return Ok(AccountBalance {
                    asset: "USDT".to_string(),
                    balance: parse_str_f64(row.get("balance")).unwrap_or(0.0),
                    available: parse_str_f64(row.get("availableBalance")).unwrap_or(0.0),
                });
            }
        }

        warn!("no USDT row in balance response — returning zero balance");
        Ok(AccountBalance { asset: "USDT".to_string(), balance: 0.0, available: 0.0 })
    }

    /// GET /fapi/v1/exchangeInfo — lot step size and min notional for a
    /// symbol.
    pub async fn fetch_symbol_filters(
        &self,
        symbol: &Symbol,
    ) -> Result<crate::exec::sizing::SymbolFilters, VenueError> {
        let query = format!("symbol={}", symbol.raw());
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/exchangeInfo", &query)
            .await?;

        let info = body
            .get("symbols")
            .and_then(|s| s.as_array())
            .and_then(|arr| arr.first())
            .ok_or_else(|| VenueError::Parse("symbol missing from exchangeInfo".to_string()))?;

        let mut filters = crate::exec::sizing::SymbolFilters::default();
        if let Some(rows) = info.get("filters").and_then(|f| f.as_array()) {
            for row in rows {
                match row.get("filterType").and_then(|t| t.as_str()) {
                    Some("LOT_SIZE") => {
                        if let Some(step) = parse_str_f64(row.get("stepSize")) {
                            filters.step_size = step;
                        }
                    }
                    Some("MIN_NOTIONAL") => {
                        if let Some(notional) = parse_str_f64(row.get("notional")) {
                            filters.min_notional = notional;
                        }
                    }
                    _ => {}
                }
            }
        }

        debug!(symbol = %symbol, ?filters, "symbol filters fetched");
        Ok(filters)
    }

    /// POST /fapi/v1/listenKey — user-data stream key.
    pub async fn create_listen_key(&self) -> Result<String, VenueError> {
        let body = self
            .request(reqwest::Method::POST, "/fapi/v1/listenKey", "")
            .await?;
        body.get("listenKey")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| VenueError::Parse("listenKey missing".to_string()))
    }

    /// PUT /fapi/v1/listenKey — keepalive.
    pub async fn keepalive_listen_key(&self) -> Result<(), VenueError> {
        self.request(reqwest::Method::PUT, "/fapi/v1/listenKey", "")
            .await?;
        Ok(())
    }
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: Option<&serde_json::Value>) -> Option<f64> {
    let val = val?;
    if let Some(s) = val.as_str() {
        s.parse::<f64>().ok()
    } else {
        val.as_f64()
    }
}

// -----------------------------------------------------------------------------
// Market data source (snapshot provider seam)
// -----------------------------------------------------------------------------

#[async_trait::async_trait]
impl MarketDataSource for VenueClient {
    /// GET /fapi/v1/klines — array-of-arrays:
    /// [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume, ...
    async fn fetch_klines(
        &self,
        symbol: &Symbol,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        let query = format!("symbol={}&interval={interval}&limit={limit}", symbol.raw());
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/klines", &query)
            .await?;

        let raw = body
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("klines response is not an array"))?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry
                .as_array()
                .ok_or_else(|| anyhow::anyhow!("kline entry is not an array"))?;
            if arr.len() < 6 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }
            candles.push(Candle {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: parse_str_f64(Some(&arr[1])).unwrap_or(0.0),
                high: parse_str_f64(Some(&arr[2])).unwrap_or(0.0),
                low: parse_str_f64(Some(&arr[3])).unwrap_or(0.0),
                close: parse_str_f64(Some(&arr[4])).unwrap_or(0.0),
                volume: parse_str_f64(Some(&arr[5])).unwrap_or(0.0),
            });
        }

        debug!(symbol = %symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// GET /fapi/v1/premiumIndex — funding rate.
    async fn fetch_funding_rate(&self, symbol: &Symbol) -> Result<f64> {
        let query = format!("symbol={}", symbol.raw());
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/premiumIndex", &query)
            .await?;
        Ok(parse_str_f64(body.get("lastFundingRate")).unwrap_or(0.0))
    }

    /// GET /fapi/v1/openInterest.
    async fn fetch_open_interest(&self, symbol: &Symbol) -> Result<f64> {
        let query = format!("symbol={}", symbol.raw());
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/openInterest", &query)
            .await?;
        Ok(parse_str_f64(body.get("openInterest")).unwrap_or(0.0))
    }

    /// GET /fapi/v1/premiumIndex — mark price.
    async fn fetch_mark_price(&self, symbol: &Symbol) -> Result<f64> {
        let query = format!("symbol={}", symbol.raw());
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/premiumIndex", &query)
            .await?;
        parse_str_f64(body.get("markPrice"))
            .ok_or_else(|| anyhow::anyhow!("premiumIndex missing markPrice"))
    }

    /// GET /fapi/v1/aggTrades filtered down to the large-trade tape.
    async fn fetch_large_trades(&self, symbol: &Symbol, limit: u32) -> Result<Vec<LargeTrade>> {
        let query = format!("symbol={}&limit=500", symbol.raw());
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/aggTrades", &query)
            .await?;

        let rows = body
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("aggTrades response is not an array"))?;

        let mut trades: Vec<LargeTrade> = rows
            .iter()
            .filter_map(|row| {
                let price = parse_str_f64(row.get("p"))?;
                let qty = parse_str_f64(row.get("q"))?;
                (price * qty >= LARGE_TRADE_NOTIONAL).then(|| LargeTrade {
                    price,
                    qty,
                    // "m" = buyer is maker, so the taker was the seller.
                    buyer_is_taker: !row.get("m").and_then(|v| v.as_bool()).unwrap_or(false),
                    ts: row.get("T").and_then(|v| v.as_i64()).unwrap_or(0),
                })
            })
            .collect();

        trades.truncate(limit as usize);
        Ok(trades)
    }
}

impl std::fmt::Debug for VenueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testnet_flag_selects_endpoints() {
        let mainnet = VenueClient::new("k", "s", false);
        assert!(mainnet.base_url.contains("fapi.binance.com"));
        let testnet = VenueClient::new("k", "s", true);
        assert!(testnet.base_url.contains("testnet"));
    }

    #[test]
    fn mark_stream_url_lowercases_symbols() {
        let client = VenueClient::new("k", "s", false);
        let url = client.mark_stream_url(&[
            Symbol::parse("BTCUSDT").unwrap(),
            Symbol::parse("ETHUSDT").unwrap(),
        ]);
        assert!(url.contains("btcusdt@markPrice@1s"));
        assert!(url.contains("ethusdt@markPrice@1s"));
    }

    #[test]
    fn order_ack_parses_string_numbers() {
        let body = serde_json::json!({
            "symbol": "BTCUSDT",
            "orderId": 123456,
            "clientOrderId": "signal:42",
            "side": "BUY",
            "positionSide": "LONG",
            "status": "FILLED",
            "avgPrice": "50123.40",
            "executedQty": "0.003"
        });
        let ack = VenueClient::parse_order_ack(&body).unwrap();
        assert_eq!(ack.client_id, "signal:42");
        assert!(ack.is_filled());
        assert!((ack.avg_price - 50123.40).abs() < 1e-9);
        assert!((ack.executed_qty - 0.003).abs() < 1e-12);
    }

    #[test]
    fn order_ack_rejects_missing_fields() {
        let body = serde_json::json!({"symbol": "BTCUSDT"});
        assert!(VenueClient::parse_order_ack(&body).is_err());
    }

    #[test]
    fn debug_redacts_credentials() {
        let client = VenueClient::new("key-material", "secret-material", true);
        let dbg = format!("{client:?}");
        assert!(!dbg.contains("key-material"));
        assert!(!dbg.contains("secret-material"));
    }

    #[test]
    fn signed_query_appends_window_and_signature() {
        let client = VenueClient::new("k", "topsecret", true);
        let qs = client.signed_query("symbol=BTCUSDT");
        assert!(qs.starts_with("symbol=BTCUSDT&timestamp="));
        assert!(qs.contains(&format!("recvWindow={RECV_WINDOW}")));
        let sig = qs.rsplit("signature=").next().unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));

        // No leading '&' when there are no caller params.
        let bare = client.signed_query("");
        assert!(bare.starts_with("timestamp="));
    }
}
