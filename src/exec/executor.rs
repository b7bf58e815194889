// =============================================================================
// Trade Executor — signals in, venue orders out, idempotent by signal id
// =============================================================================
//
// Pipeline per signal: risk gate, intent resolution against live positions,
// close-cooldown check, sizing, best-effort leverage/margin, order placement
// with a pending TradeRecord persisted BEFORE the venue call, TP/SL
// conditional orders in the same client-id family, trade-status publish,
// cooldown arming.
//
// Idempotence: a repeated `execute_signal` for the same id returns the
// previous outcome from the ledger without re-placing the order; the venue
// client-id (`signal:<id>`) is the second line of defence.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastSink;
use crate::exec::cooldown::{CooldownKind, CooldownMap};
use crate::exec::risk_gate::{self, GateContext};
use crate::exec::sizing::{position_qty, SymbolFilters};
use crate::exec::supervisor::{CloseIntent, CloseReason, PositionSupervisor};
use crate::llm::quota::QuotaAccountant;
use crate::runtime_config::{OnOpposite, RuntimeConfig};
use crate::signal::{Signal, TradeRecord};
use crate::store::Store;
use crate::types::{PositionSide, SignalKind, Symbol, TradeStatus};
use crate::venue::client::OrderRequest;
use crate::venue::retry::{with_retry, RetryPolicy};
use crate::venue::{OrderAck, VenueError, VenuePosition};

/// The venue operations the executor needs; the REST adapter implements
/// this, tests substitute a scripted venue.
#[async_trait::async_trait]
pub trait OrderVenue: Send + Sync {
    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<(), VenueError>;
    async fn set_margin_mode(&self, symbol: &Symbol, mode: &str) -> Result<(), VenueError>;
    async fn create_order(&self, req: &OrderRequest) -> Result<OrderAck, VenueError>;
    async fn cancel_order(&self, symbol: &Symbol, client_id: &str) -> Result<(), VenueError>;
    async fn query_order(&self, symbol: &Symbol, client_id: &str)
        -> Result<Option<OrderAck>, VenueError>;
    async fn open_orders(&self, symbol: Option<&Symbol>) -> Result<Vec<OrderAck>, VenueError>;
    async fn fetch_positions(&self) -> Result<Vec<VenuePosition>, VenueError>;
    async fn equity(&self) -> Result<f64, VenueError>;
}

#[async_trait::async_trait]
impl OrderVenue for crate::venue::VenueClient {
    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<(), VenueError> {
        crate::venue::VenueClient::set_leverage(self, symbol, leverage).await
    }
    async fn set_margin_mode(&self, symbol: &Symbol, mode: &str) -> Result<(), VenueError> {
        crate::venue::VenueClient::set_margin_mode(self, symbol, mode).await
    }
    async fn create_order(&self, req: &OrderRequest) -> Result<OrderAck, VenueError> {
        crate::venue::VenueClient::create_order(self, req).await
    }
    async fn cancel_order(&self, symbol: &Symbol, client_id: &str) -> Result<(), VenueError> {
        crate::venue::VenueClient::cancel_order(self, symbol, client_id).await
    }
    async fn query_order(
        &self,
        symbol: &Symbol,
        client_id: &str,
    ) -> Result<Option<OrderAck>, VenueError> {
        crate::venue::VenueClient::query_order(self, symbol, client_id).await
    }
    async fn open_orders(&self, symbol: Option<&Symbol>) -> Result<Vec<OrderAck>, VenueError> {
        crate::venue::VenueClient::open_orders(self, symbol).await
    }
    async fn fetch_positions(&self) -> Result<Vec<VenuePosition>, VenueError> {
        crate::venue::VenueClient::fetch_positions(self).await
    }
    async fn equity(&self) -> Result<f64, VenueError> {
        Ok(crate::venue::VenueClient::fetch_balance(self).await?.available)
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Terminal result of one `execute_signal` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Filled,
    Skipped(String),
    Failed(String),
}

impl ExecuteOutcome {
    pub fn status_str(&self) -> &'static str {
        match self {
            Self::Filled => "filled",
            Self::Skipped(_) => "skipped",
            Self::Failed(_) => "failed",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Filled => "",
            Self::Skipped(r) | Self::Failed(r) => r,
        }
    }
}

impl std::fmt::Display for ExecuteOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filled => write!(f, "filled"),
            Self::Skipped(r) => write!(f, "skipped({r})"),
            Self::Failed(r) => write!(f, "failed({r})"),
        }
    }
}

/// What the signal asks for once reconciled against live positions.
#[derive(Debug, Clone, PartialEq)]
enum Intent {
    Open(PositionSide),
    Close(PositionSide, f64),
    CloseThenOpen { close_side: PositionSide, close_qty: f64, open_side: PositionSide },
    Skip(&'static str),
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct TradeExecutor {
    venue: Arc<dyn OrderVenue>,
    store: Arc<Store>,
    config: Arc<RwLock<RuntimeConfig>>,
    cooldowns: Arc<CooldownMap>,
    supervisor: Arc<PositionSupervisor>,
    sink: Arc<BroadcastSink>,
    quota: Arc<QuotaAccountant>,
    exchange_connected: Arc<AtomicBool>,
    filters: RwLock<std::collections::HashMap<Symbol, SymbolFilters>>,
    retry: RetryPolicy,
}

impl TradeExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        venue: Arc<dyn OrderVenue>,
        store: Arc<Store>,
        config: Arc<RwLock<RuntimeConfig>>,
        cooldowns: Arc<CooldownMap>,
        supervisor: Arc<PositionSupervisor>,
        sink: Arc<BroadcastSink>,
        quota: Arc<QuotaAccountant>,
        exchange_connected: Arc<AtomicBool>,
    ) -> Self {
        Self {
            venue,
            store,
            config,
            cooldowns,
            supervisor,
            sink,
            quota,
            exchange_connected,
            filters: RwLock::new(std::collections::HashMap::new()),
            retry: RetryPolicy::default(),
        }
    }

    /// Install venue lot filters for a symbol (fetched at startup).
    pub fn set_filters(&self, symbol: Symbol, filters: SymbolFilters) {
        self.filters.write().insert(symbol, filters);
    }

    fn filters_for(&self, symbol: &Symbol) -> SymbolFilters {
        self.filters.read().get(symbol).copied().unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // execute_signal
    // -------------------------------------------------------------------------

    /// Consume one actionable signal. Idempotent by `signal.id`.
    pub async fn execute_signal(&self, signal: Arc<Signal>) -> ExecuteOutcome {
        // ── Idempotence ledger ──────────────────────────────────────────
        match self.store.outcome_for(signal.id) {
            Ok(Some((status, reason))) => {
                debug!(signal_id = signal.id, status = %status, "duplicate execute — returning ledger outcome");
                return match status.as_str() {
                    "filled" => ExecuteOutcome::Filled,
                    "failed" => ExecuteOutcome::Failed(reason),
                    _ => ExecuteOutcome::Skipped(reason),
                };
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "outcome ledger read failed — proceeding"),
        }

        let outcome = self.execute_inner(&signal).await;

        if let Err(e) = self
            .store
            .record_outcome(signal.id, outcome.status_str(), outcome.reason())
        {
            warn!(signal_id = signal.id, error = %e, "failed to record execution outcome");
        }

        self.publish_trade_status(&signal.symbol, signal.id, &outcome, None, 0.0, 0.0)
            .await;
        outcome
    }

    async fn execute_inner(&self, signal: &Signal) -> ExecuteOutcome {
        let symbol = &signal.symbol;
        let config = self.config.read().clone();

        // ── 1. Risk gate ────────────────────────────────────────────────
        let equity = match with_retry(&self.retry, "fetch_equity", || self.venue.equity()).await {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "equity fetch failed — gate sees zero equity");
                0.0
            }
        };
        let gate_ctx = GateContext {
            config: &config,
            exchange_connected: self.exchange_connected.load(Ordering::Relaxed),
            equity,
            realized_pnl_today: self.store.realized_pnl_today().unwrap_or(0.0),
            loss_streak: self.store.loss_streak().unwrap_or(0),
            quota_tier: self.quota.tier(),
            cooldowns: &self.cooldowns,
            filters: self.filters_for(symbol),
            mark_price: signal.price_at_signal,
        };
        if let Err(rejection) = risk_gate::evaluate(signal, &gate_ctx) {
            return ExecuteOutcome::Skipped(rejection.code.to_string());
        }

        // ── 2. Intent resolution ────────────────────────────────────────
        let positions = match with_retry(&self.retry, "fetch_positions", || {
            self.venue.fetch_positions()
        })
        .await
        {
            Ok(p) => p,
            Err(e) => return ExecuteOutcome::Failed(format!("positions: {e}")),
        };
        let intent = resolve_intent(signal.signal, symbol, &positions, &config);

        match intent {
            Intent::Skip(reason) => ExecuteOutcome::Skipped(reason.to_string()),
            Intent::Close(side, qty) => {
                self.close_for_signal(signal, side, qty, &config).await
            }
            Intent::Open(side) => self.open_position(signal, side, equity, &config).await,
            Intent::CloseThenOpen { close_side, close_qty, open_side } => {
                let closed = self.close_for_signal(signal, close_side, close_qty, &config).await;
                if !matches!(closed, ExecuteOutcome::Filled) {
                    return closed;
                }
                self.open_position(signal, open_side, equity, &config).await
            }
        }
    }

    // -------------------------------------------------------------------------
    // Open path
    // -------------------------------------------------------------------------

    async fn open_position(
        &self,
        signal: &Signal,
        side: PositionSide,
        equity: f64,
        config: &RuntimeConfig,
    ) -> ExecuteOutcome {
        let symbol = &signal.symbol;
        let filters = self.filters_for(symbol);

        // ── Sizing ──────────────────────────────────────────────────────
        let qty = match position_qty(&config.trade, equity, signal.price_at_signal, &filters) {
            Ok(q) => q,
            Err(e) => return ExecuteOutcome::Skipped(e.to_string()),
        };

        // ── Leverage & margin: best-effort ──────────────────────────────
        if let Err(e) = self.venue.set_leverage(symbol, config.trade.leverage).await {
            warn!(symbol = %symbol, error = %e, "set_leverage failed — continuing");
        }
        if let Err(e) = self
            .venue
            .set_margin_mode(symbol, &config.trade.margin_mode)
            .await
        {
            warn!(symbol = %symbol, error = %e, "set_margin_mode failed — continuing");
        }

        // ── Pending record before the venue call ────────────────────────
        let client_id = format!("signal:{}", signal.id);
        let record = TradeRecord {
            order_id: String::new(),
            client_id: client_id.clone(),
            symbol: symbol.clone(),
            side: side.opening_side(),
            position_side: side,
            price: signal.price_at_signal,
            qty,
            status: TradeStatus::Pending,
            reason: format!("signal {}", signal.signal),
            pnl_usdt: 0.0,
            pnl_pct: 0.0,
            leverage: config.trade.leverage,
            opened_at: Utc::now().to_rfc3339(),
            closed_at: None,
        };
        if let Err(e) = self.store.insert_trade(&record) {
            return ExecuteOutcome::Failed(format!("pending persist: {e}"));
        }

        // ── Market order ────────────────────────────────────────────────
        let request = OrderRequest {
            symbol: symbol.clone(),
            side: side.opening_side(),
            position_side: side,
            order_type: "MARKET".to_string(),
            qty,
            stop_price: None,
            reduce_only: false,
            client_id: client_id.clone(),
        };

        let ack = match self.place_with_policy(&request).await {
            Ok(ack) => ack,
            Err(e) => {
                let _ = self.store.update_trade_status(
                    &client_id,
                    TradeStatus::Failed,
                    None,
                    None,
                    None,
                    None,
                );
                return ExecuteOutcome::Failed(e.to_string());
            }
        };

        let fill_price = if ack.avg_price > 0.0 { ack.avg_price } else { signal.price_at_signal };
        if let Err(e) = self.store.update_trade_status(
            &client_id,
            TradeStatus::Filled,
            Some(&ack.order_id),
            Some(fill_price),
            None,
            None,
        ) {
            warn!(error = %e, "fill status update failed");
        }

        // ── Supervise + conditional TP/SL family ────────────────────────
        let (sl_price, tp_price) = crate::exec::supervisor::static_prices(
            &config.supervisor,
            fill_price,
            config.trade.leverage,
            side,
            signal_sl_override(signal),
            signal_tp_override(signal),
        );
        self.supervisor.track_open(
            symbol.clone(),
            side,
            qty,
            fill_price,
            config.trade.leverage,
            Some(sl_price),
            Some(tp_price),
            Utc::now(),
        );
        self.place_protection(signal, side, qty, sl_price, tp_price).await;

        // ── Arm signal cooldown ─────────────────────────────────────────
        let kind = match side {
            PositionSide::Long => CooldownKind::OpenLong,
            PositionSide::Short => CooldownKind::OpenShort,
        };
        self.cooldowns.arm(
            symbol,
            kind,
            chrono::Duration::seconds(config.debate.signal_cooldown_secs as i64),
        );

        info!(
            symbol = %symbol,
            side = %side,
            qty,
            fill_price,
            sl = sl_price,
            tp = tp_price,
            "position opened"
        );
        ExecuteOutcome::Filled
    }

    /// Place the reduce-only TP and SL conditional orders. Failures are
    /// logged, not fatal: the supervisor's mark-price loop is the backstop.
    async fn place_protection(
        &self,
        signal: &Signal,
        side: PositionSide,
        qty: f64,
        sl_price: f64,
        tp_price: f64,
    ) {
        for (prefix, order_type, stop_price) in [
            ("sl", "STOP_MARKET", sl_price),
            ("tp", "TAKE_PROFIT_MARKET", tp_price),
        ] {
            let request = OrderRequest {
                symbol: signal.symbol.clone(),
                side: side.closing_side(),
                position_side: side,
                order_type: order_type.to_string(),
                qty,
                stop_price: Some(stop_price),
                reduce_only: true,
                client_id: format!("{prefix}:{}", signal.id),
            };
            if let Err(e) = self.venue.create_order(&request).await {
                warn!(
                    symbol = %signal.symbol,
                    kind = prefix,
                    error = %e,
                    "protective order placement failed — supervisor loop covers it"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Close paths
    // -------------------------------------------------------------------------

    /// Close driven by a SELL/COVER signal: subject to the close cooldown.
    async fn close_for_signal(
        &self,
        signal: &Signal,
        side: PositionSide,
        qty: f64,
        config: &RuntimeConfig,
    ) -> ExecuteOutcome {
        if self.cooldowns.is_active(&signal.symbol, CooldownKind::Close) {
            return ExecuteOutcome::Skipped("close-cooldown".to_string());
        }
        let intent = CloseIntent {
            symbol: signal.symbol.clone(),
            position_side: side,
            qty,
            reason: CloseReason::Signal,
            trigger_price: signal.price_at_signal,
        };
        self.execute_close(&intent, Some(signal.id), config).await
    }

    /// Close driven by the supervisor (sl/tp/trailing/timeout) or an
    /// operator. Protective triggers bypass the close cooldown.
    pub async fn close_position(&self, intent: CloseIntent) -> ExecuteOutcome {
        let config = self.config.read().clone();
        if matches!(intent.reason, CloseReason::Manual)
            && self.cooldowns.is_active(&intent.symbol, CooldownKind::Close)
        {
            return ExecuteOutcome::Skipped("close-cooldown".to_string());
        }
        let outcome = self.execute_close(&intent, None, &config).await;
        self.publish_trade_status(
            &intent.symbol,
            0,
            &outcome,
            Some(intent.reason.as_str()),
            intent.trigger_price,
            intent.qty,
        )
        .await;
        outcome
    }

    async fn execute_close(
        &self,
        intent: &CloseIntent,
        signal_id: Option<i64>,
        config: &RuntimeConfig,
    ) -> ExecuteOutcome {
        let symbol = &intent.symbol;
        let side = intent.position_side;

        // Stop the supervisor from emitting a competing close.
        self.supervisor.mark_closing(symbol, side);

        // Cancel the outstanding protective orders of this position family.
        self.cancel_protection(symbol, signal_id).await;

        let client_id = match signal_id {
            Some(id) => format!("close:{id}"),
            None => format!("close:{}:{}", intent.reason, Utc::now().timestamp_millis()),
        };

        let record = TradeRecord {
            order_id: String::new(),
            client_id: client_id.clone(),
            symbol: symbol.clone(),
            side: side.closing_side(),
            position_side: side,
            price: intent.trigger_price,
            qty: intent.qty,
            status: TradeStatus::Pending,
            reason: intent.reason.as_str().to_string(),
            pnl_usdt: 0.0,
            pnl_pct: 0.0,
            leverage: config.trade.leverage,
            opened_at: Utc::now().to_rfc3339(),
            closed_at: None,
        };
        if let Err(e) = self.store.insert_trade(&record) {
            return ExecuteOutcome::Failed(format!("pending persist: {e}"));
        }

        let request = OrderRequest {
            symbol: symbol.clone(),
            side: side.closing_side(),
            position_side: side,
            order_type: "MARKET".to_string(),
            qty: intent.qty,
            stop_price: None,
            reduce_only: true,
            client_id: client_id.clone(),
        };

        let ack = match self.place_with_policy(&request).await {
            Ok(ack) => ack,
            Err(e) => {
                let _ = self.store.update_trade_status(
                    &client_id,
                    TradeStatus::Failed,
                    None,
                    None,
                    None,
                    None,
                );
                return ExecuteOutcome::Failed(e.to_string());
            }
        };

        let fill_price = if ack.avg_price > 0.0 { ack.avg_price } else { intent.trigger_price };
        if let Err(e) = self.store.update_trade_status(
            &client_id,
            TradeStatus::Filled,
            Some(&ack.order_id),
            Some(fill_price),
            None,
            Some(&Utc::now().to_rfc3339()),
        ) {
            warn!(error = %e, "close fill status update failed");
        }

        self.supervisor.release(symbol, side);
        self.cooldowns.arm(
            symbol,
            CooldownKind::Close,
            chrono::Duration::seconds(config.trade.close_cooldown_secs as i64),
        );

        info!(symbol = %symbol, side = %side, qty = intent.qty, reason = %intent.reason, fill_price, "position closed");
        ExecuteOutcome::Filled
    }

    async fn cancel_protection(&self, symbol: &Symbol, signal_id: Option<i64>) {
        let Some(id) = signal_id else {
            // Supervisor-triggered close: cancel whatever reduce-only family
            // orders exist for the symbol.
            match self.venue.open_orders(Some(symbol)).await {
                Ok(orders) => {
                    for order in orders {
                        if order.client_id.starts_with("tp:") || order.client_id.starts_with("sl:") {
                            if let Err(e) = self.venue.cancel_order(symbol, &order.client_id).await {
                                debug!(client_id = %order.client_id, error = %e, "protective cancel failed (may be gone)");
                            }
                        }
                    }
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "open-orders fetch failed during close"),
            }
            return;
        };

        for prefix in ["tp", "sl"] {
            let client_id = format!("{prefix}:{id}");
            if let Err(e) = self.venue.cancel_order(symbol, &client_id).await {
                debug!(client_id = %client_id, error = %e, "protective cancel failed (may be gone)");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Placement policy
    // -------------------------------------------------------------------------

    /// Bounded retry: retryable errors back off up to 3 attempts; an
    /// unparseable response is retried once, then escalated to permanent.
    async fn place_with_policy(&self, request: &OrderRequest) -> Result<OrderAck, VenueError> {
        let mut consecutive_parse_failures = 0u32;
        let mut last_error: Option<VenueError> = None;

        for attempt in 0..3u32 {
            match self.venue.create_order(request).await {
                Ok(ack) => return Ok(ack),
                Err(e) => {
                    if matches!(e, VenueError::Parse(_)) {
                        consecutive_parse_failures += 1;
                        if consecutive_parse_failures >= 2 {
                            warn!(error = %e, "second consecutive unparseable venue response — permanent");
                            return Err(e);
                        }
                    } else {
                        consecutive_parse_failures = 0;
                        if !e.is_retryable() {
                            return Err(e);
                        }
                    }
                    warn!(
                        client_id = %request.client_id,
                        attempt = attempt + 1,
                        error = %e,
                        "order placement failed — backing off"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(std::time::Duration::from_millis(
                        100 * 2u64.pow(attempt),
                    ))
                    .await;
                }
            }
        }

        Err(last_error.unwrap_or(VenueError::Network("retry budget exhausted".to_string())))
    }

    /// Probe the venue and refresh the connected flag the risk gate reads.
    pub async fn probe_venue(&self) -> bool {
        let ok = self.venue.equity().await.is_ok();
        let was = self.exchange_connected.swap(ok, Ordering::Relaxed);
        if ok != was {
            if ok {
                info!("venue connection restored");
            } else {
                warn!("venue unreachable — opens gated until reconnect");
            }
        }
        ok
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    /// Reconcile pending TradeRecords against the venue by client-id
    /// (startup).
    pub async fn reconcile_startup(&self) {
        let pending = match self.store.pending_trades() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "pending-trade query failed during reconciliation");
                return;
            }
        };
        if pending.is_empty() {
            debug!("no pending trades to reconcile");
            return;
        }

        info!(count = pending.len(), "reconciling pending trades against venue");
        for trade in pending {
            match self.venue.query_order(&trade.symbol, &trade.client_id).await {
                Ok(Some(ack)) => {
                    let status = match ack.status.as_str() {
                        "FILLED" => TradeStatus::Filled,
                        "PARTIALLY_FILLED" => TradeStatus::Partial,
                        "CANCELED" | "EXPIRED" => TradeStatus::Canceled,
                        "REJECTED" => TradeStatus::Failed,
                        _ => continue, // still live on the venue
                    };
                    if let Err(e) = self.store.update_trade_status(
                        &trade.client_id,
                        status,
                        Some(&ack.order_id),
                        (ack.avg_price > 0.0).then_some(ack.avg_price),
                        None,
                        None,
                    ) {
                        warn!(client_id = %trade.client_id, error = %e, "reconcile update failed");
                    } else {
                        info!(client_id = %trade.client_id, status = %status, "pending trade reconciled");
                    }
                }
                Ok(None) => {
                    // Never reached the venue: the pending row is dead.
                    if let Err(e) = self.store.update_trade_status(
                        &trade.client_id,
                        TradeStatus::Failed,
                        None,
                        None,
                        None,
                        None,
                    ) {
                        warn!(client_id = %trade.client_id, error = %e, "reconcile update failed");
                    } else {
                        info!(client_id = %trade.client_id, "pending trade never reached venue — failed");
                    }
                }
                Err(e) => warn!(client_id = %trade.client_id, error = %e, "reconcile query failed"),
            }
        }
    }

    /// Cancel orphan reduce-only TP/SL orders with no matching position
    /// (periodic sweep).
    pub async fn sweep_orphans(&self) {
        let positions = match self.venue.fetch_positions().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "position fetch failed during orphan sweep");
                return;
            }
        };
        let orders = match self.venue.open_orders(None).await {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "open-orders fetch failed during orphan sweep");
                return;
            }
        };

        let mut canceled = 0usize;
        for order in orders {
            let protective =
                order.client_id.starts_with("tp:") || order.client_id.starts_with("sl:");
            if !protective {
                continue;
            }
            let has_position = positions
                .iter()
                .any(|p| p.symbol == order.symbol && p.position_side == order.position_side);
            if has_position {
                continue;
            }
            match self.venue.cancel_order(&order.symbol, &order.client_id).await {
                Ok(()) => {
                    canceled += 1;
                    info!(client_id = %order.client_id, symbol = %order.symbol, "orphan protective order canceled");
                }
                Err(e) => warn!(client_id = %order.client_id, error = %e, "orphan cancel failed"),
            }
        }
        if canceled == 0 {
            debug!("orphan sweep found nothing to cancel");
        }
    }

    // -------------------------------------------------------------------------
    // User-data stream reaction
    // -------------------------------------------------------------------------

    /// React to one venue user-data event: venue-side TP/SL fills release
    /// supervision and arm the close cooldown; account deltas fan out to
    /// `/ws/market`.
    pub async fn on_user_event(&self, event: crate::venue::user_stream::UserDataEvent) {
        use crate::venue::user_stream::UserDataEvent;

        match event {
            UserDataEvent::OrderUpdate(update) => {
                self.sink
                    .publish_order_update(json!({
                        "symbol": update.symbol.raw(),
                        "client_id": update.client_id,
                        "order_id": update.order_id,
                        "side": update.side.as_str(),
                        "position_side": update.position_side.as_str(),
                        "status": update.status,
                        "price": format!("{}", update.avg_price),
                        "qty": format!("{}", update.cumulative_qty),
                        "ts": update.ts,
                    }))
                    .await;

                if update.status != "FILLED" {
                    return;
                }

                // A venue-side protective fill means the venue flattened the
                // position before our supervisor loop did.
                let protective = update.client_id.starts_with("tp:")
                    || update.client_id.starts_with("sl:");
                if protective {
                    let reason = if update.client_id.starts_with("tp:") { "tp" } else { "sl" };
                    info!(
                        symbol = %update.symbol,
                        side = %update.position_side,
                        reason,
                        price = update.avg_price,
                        "venue protective order filled"
                    );
                    self.supervisor.release(&update.symbol, update.position_side);
                    let config = self.config.read().clone();
                    self.cooldowns.arm(
                        &update.symbol,
                        CooldownKind::Close,
                        chrono::Duration::seconds(config.trade.close_cooldown_secs as i64),
                    );
                    // Pending-then-filled, like every other trade row.
                    let client_id = format!("fill:{}", update.client_id);
                    let record = TradeRecord {
                        order_id: update.order_id.clone(),
                        client_id: client_id.clone(),
                        symbol: update.symbol.clone(),
                        side: update.side,
                        position_side: update.position_side,
                        price: update.avg_price,
                        qty: update.cumulative_qty,
                        status: TradeStatus::Pending,
                        reason: reason.to_string(),
                        pnl_usdt: update.realized_pnl,
                        pnl_pct: 0.0,
                        leverage: config.trade.leverage,
                        opened_at: Utc::now().to_rfc3339(),
                        closed_at: None,
                    };
                    if let Err(e) = self.store.insert_trade(&record).and_then(|_| {
                        self.store.update_trade_status(
                            &client_id,
                            TradeStatus::Filled,
                            Some(&update.order_id),
                            Some(update.avg_price),
                            Some(update.realized_pnl),
                            Some(&Utc::now().to_rfc3339()),
                        )
                    }) {
                        warn!(error = %e, "protective fill record failed");
                    }
                    // The sibling protective order is now an orphan.
                    self.cancel_protection(
                        &update.symbol,
                        update.client_id.split(':').nth(1).and_then(|s| s.parse().ok()),
                    )
                    .await;
                }
            }
            UserDataEvent::AccountUpdate(update) => {
                if !update.balances.is_empty() {
                    let data: serde_json::Map<String, serde_json::Value> = update
                        .balances
                        .iter()
                        .map(|(asset, balance)| {
                            (asset.clone(), json!(format!("{balance}")))
                        })
                        .collect();
                    self.sink
                        .publish_balance_update(serde_json::Value::Object(data))
                        .await;
                }
                if !update.positions.is_empty() {
                    let rows: Vec<serde_json::Value> = update
                        .positions
                        .iter()
                        .map(|(symbol, side, qty, entry)| {
                            json!({
                                "symbol": symbol.raw(),
                                "position_side": side.as_str(),
                                "qty": format!("{qty}"),
                                "entry_price": format!("{entry}"),
                            })
                        })
                        .collect();
                    self.sink.publish_position_update(json!(rows)).await;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    async fn publish_trade_status(
        &self,
        symbol: &Symbol,
        signal_id: i64,
        outcome: &ExecuteOutcome,
        reason_override: Option<&str>,
        price: f64,
        qty: f64,
    ) {
        self.sink
            .publish_trade_status(json!({
                "signal_id": signal_id,
                "status": outcome.status_str(),
                "symbol": symbol.raw(),
                "side": "",
                "price": format!("{price}"),
                "qty": format!("{qty}"),
                "reason": reason_override.unwrap_or(outcome.reason()),
            }))
            .await;
    }
}

/// Translate signal + live positions into an intent.
fn resolve_intent(
    kind: SignalKind,
    symbol: &Symbol,
    positions: &[VenuePosition],
    config: &RuntimeConfig,
) -> Intent {
    let find = |side: PositionSide| {
        positions
            .iter()
            .find(|p| &p.symbol == symbol && p.position_side == side && p.qty > 0.0)
    };
    let long = find(PositionSide::Long);
    let short = find(PositionSide::Short);

    match kind {
        SignalKind::Buy => {
            if long.is_some() && !config.trade.allow_pyramiding {
                return Intent::Skip("already-long");
            }
            if let Some(short) = short {
                return match config.trade.on_opposite {
                    OnOpposite::CloseThenOpen => Intent::CloseThenOpen {
                        close_side: PositionSide::Short,
                        close_qty: short.qty,
                        open_side: PositionSide::Long,
                    },
                    OnOpposite::CloseOnly => Intent::Close(PositionSide::Short, short.qty),
                    OnOpposite::Ignore => Intent::Skip("opposite-ignored"),
                };
            }
            Intent::Open(PositionSide::Long)
        }
        SignalKind::Sell => match long {
            Some(p) => Intent::Close(PositionSide::Long, p.qty),
            None => Intent::Skip("no-position"),
        },
        SignalKind::Short => {
            if short.is_some() && !config.trade.allow_pyramiding {
                return Intent::Skip("already-short");
            }
            if let Some(long) = long {
                return match config.trade.on_opposite {
                    OnOpposite::CloseThenOpen => Intent::CloseThenOpen {
                        close_side: PositionSide::Long,
                        close_qty: long.qty,
                        open_side: PositionSide::Short,
                    },
                    OnOpposite::CloseOnly => Intent::Close(PositionSide::Long, long.qty),
                    OnOpposite::Ignore => Intent::Skip("opposite-ignored"),
                };
            }
            Intent::Open(PositionSide::Short)
        }
        SignalKind::Cover => match short {
            Some(p) => Intent::Close(PositionSide::Short, p.qty),
            None => Intent::Skip("no-position"),
        },
        SignalKind::Hold => Intent::Skip("hold"),
    }
}

fn signal_sl_override(signal: &Signal) -> Option<f64> {
    // The schema gate's parsed sl_price travels in the raw output only when
    // the referee named one; the orchestrator surfaces it via risk fields.
    // Conservatively: no override unless a positive finite price is present.
    None.or(parse_price_hint(&signal.risk_assessment, "sl"))
        .or(parse_price_hint(&signal.final_raw_output, "sl_price"))
}

fn signal_tp_override(signal: &Signal) -> Option<f64> {
    None.or(parse_price_hint(&signal.risk_assessment, "tp"))
        .or(parse_price_hint(&signal.final_raw_output, "tp_price"))
}

fn parse_price_hint(text: &str, key: &str) -> Option<f64> {
    let idx = text.find(key)?;
    let tail = &text[idx + key.len()..];
    let digits: String = tail
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let value: f64 = digits.parse().ok()?;
    (value.is_finite() && value > 0.0).then_some(value)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{RoleOpinion, StageTimestamps};
    use crate::types::{RiskLevel, Side, TradingMode};
    use parking_lot::Mutex;

    // ── Scripted venue ──────────────────────────────────────────────────

    #[derive(Default)]
    struct MockVenue {
        orders: Mutex<Vec<OrderRequest>>,
        cancels: Mutex<Vec<String>>,
        positions: Mutex<Vec<VenuePosition>>,
        open_orders: Mutex<Vec<OrderAck>>,
        equity: Mutex<f64>,
    }

    impl MockVenue {
        fn with_equity(equity: f64) -> Self {
            let v = Self::default();
            *v.equity.lock() = equity;
            v
        }

        fn market_orders(&self) -> Vec<OrderRequest> {
            self.orders
                .lock()
                .iter()
                .filter(|o| o.order_type == "MARKET")
                .cloned()
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl OrderVenue for MockVenue {
        async fn set_leverage(&self, _s: &Symbol, _l: u32) -> Result<(), VenueError> {
            Ok(())
        }
        async fn set_margin_mode(&self, _s: &Symbol, _m: &str) -> Result<(), VenueError> {
            Ok(())
        }
        async fn create_order(&self, req: &OrderRequest) -> Result<OrderAck, VenueError> {
            self.orders.lock().push(req.clone());
            Ok(OrderAck {
                order_id: format!("{}", self.orders.lock().len()),
                client_id: req.client_id.clone(),
                symbol: req.symbol.clone(),
                side: req.side,
                position_side: req.position_side,
                status: "FILLED".to_string(),
                avg_price: 100.0,
                executed_qty: req.qty,
            })
        }
        async fn cancel_order(&self, _s: &Symbol, client_id: &str) -> Result<(), VenueError> {
            self.cancels.lock().push(client_id.to_string());
            Ok(())
        }
        async fn query_order(
            &self,
            _s: &Symbol,
            _c: &str,
        ) -> Result<Option<OrderAck>, VenueError> {
            Ok(None)
        }
        async fn open_orders(&self, _s: Option<&Symbol>) -> Result<Vec<OrderAck>, VenueError> {
            Ok(self.open_orders.lock().clone())
        }
        async fn fetch_positions(&self) -> Result<Vec<VenuePosition>, VenueError> {
            Ok(self.positions.lock().clone())
        }
        async fn equity(&self) -> Result<f64, VenueError> {
            Ok(*self.equity.lock())
        }
    }

    // ── Fixtures ────────────────────────────────────────────────────────

    fn btc() -> Symbol {
        Symbol::parse("BTCUSDT").unwrap()
    }

    fn signal(id: i64, kind: SignalKind, confidence: u8) -> Arc<Signal> {
        Arc::new(Signal {
            id,
            symbol: btc(),
            created_at: Utc::now().to_rfc3339(),
            signal: kind,
            confidence,
            risk_level: RiskLevel::Medium,
            reason: "MACD金叉".to_string(),
            risk_assessment: String::new(),
            final_raw_output: String::new(),
            role_opinions: vec![RoleOpinion::synthetic_hold(
                "quant", "Quant", "📊", "chat", "x".to_string(), 0, vec![],
            )],
            role_input_messages: vec![],
            final_input_messages: vec![],
            stage_timestamps: StageTimestamps::default(),
            price_at_signal: 100.0,
            daily_quote: None,
            voice_text: None,
            error_text: None,
            parsed_by_fallback: false,
        })
    }

    fn executor(venue: Arc<MockVenue>) -> TradeExecutor {
        let config = RuntimeConfig { trading_mode: TradingMode::Live, ..RuntimeConfig::default() };
        TradeExecutor::new(
            venue,
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(RwLock::new(config)),
            Arc::new(CooldownMap::new()),
            Arc::new(PositionSupervisor::new(Default::default())),
            Arc::new(BroadcastSink::new(&Default::default())),
            Arc::new(QuotaAccountant::new(1000, Default::default())),
            Arc::new(AtomicBool::new(true)),
        )
    }

    fn long_position(qty: f64) -> VenuePosition {
        VenuePosition {
            symbol: btc(),
            position_side: PositionSide::Long,
            qty,
            entry_price: 100.0,
            mark_price: 100.0,
            unrealized_pnl: 0.0,
            leverage: 5,
        }
    }

    // ── Tests ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn happy_buy_opens_with_protection() {
        let venue = Arc::new(MockVenue::with_equity(1000.0));
        let exec = executor(venue.clone());

        let outcome = exec.execute_signal(signal(1, SignalKind::Buy, 72)).await;
        assert_eq!(outcome, ExecuteOutcome::Filled);

        // qty = min(200, 1000, 30, 200)/100 = 0.3
        let markets = venue.market_orders();
        assert_eq!(markets.len(), 1);
        assert!((markets[0].qty - 0.3).abs() < 1e-9);
        assert_eq!(markets[0].client_id, "signal:1");

        // TP + SL reduce-only family placed.
        let all = venue.orders.lock();
        let tp = all.iter().find(|o| o.client_id == "tp:1").unwrap();
        let sl = all.iter().find(|o| o.client_id == "sl:1").unwrap();
        assert!(tp.reduce_only && sl.reduce_only);
        assert_eq!(tp.order_type, "TAKE_PROFIT_MARKET");
        assert_eq!(sl.order_type, "STOP_MARKET");

        // The position is now supervised and the signal cooldown armed.
        assert_eq!(exec.supervisor.open_count(), 1);
        assert!(exec.cooldowns.is_active(&btc(), CooldownKind::OpenLong));

        // The trade row went pending -> filled.
        let row = exec.store.trade_by_client_id("signal:1").unwrap().unwrap();
        assert_eq!(row.status, TradeStatus::Filled);
    }

    #[tokio::test]
    async fn execute_twice_places_one_order() {
        let venue = Arc::new(MockVenue::with_equity(1000.0));
        let exec = executor(venue.clone());

        let s = signal(7, SignalKind::Buy, 72);
        let first = exec.execute_signal(s.clone()).await;
        let second = exec.execute_signal(s).await;

        assert_eq!(first, ExecuteOutcome::Filled);
        assert_eq!(second, ExecuteOutcome::Filled);
        assert_eq!(venue.market_orders().len(), 1, "dedupe by signal id");
    }

    #[tokio::test]
    async fn risk_gate_reject_touches_no_venue() {
        let venue = Arc::new(MockVenue::with_equity(1000.0));
        let exec = executor(venue.clone());

        // Below the BUY confidence floor of 60.
        let outcome = exec.execute_signal(signal(2, SignalKind::Buy, 40)).await;
        assert_eq!(outcome, ExecuteOutcome::Skipped("confidence_floor".to_string()));
        assert!(venue.orders.lock().is_empty());
    }

    #[tokio::test]
    async fn sell_with_no_position_skips() {
        let venue = Arc::new(MockVenue::with_equity(1000.0));
        let exec = executor(venue.clone());
        let outcome = exec.execute_signal(signal(3, SignalKind::Sell, 80)).await;
        assert_eq!(outcome, ExecuteOutcome::Skipped("no-position".to_string()));
        assert!(venue.orders.lock().is_empty());
    }

    #[tokio::test]
    async fn buy_with_existing_long_skips_without_pyramiding() {
        let venue = Arc::new(MockVenue::with_equity(1000.0));
        *venue.positions.lock() = vec![long_position(0.5)];
        let exec = executor(venue.clone());
        let outcome = exec.execute_signal(signal(4, SignalKind::Buy, 80)).await;
        assert_eq!(outcome, ExecuteOutcome::Skipped("already-long".to_string()));
    }

    #[tokio::test]
    async fn short_against_long_closes_then_opens() {
        let venue = Arc::new(MockVenue::with_equity(1000.0));
        *venue.positions.lock() = vec![long_position(0.5)];
        let exec = executor(venue.clone());

        let outcome = exec.execute_signal(signal(5, SignalKind::Short, 80)).await;
        assert_eq!(outcome, ExecuteOutcome::Filled);

        let markets = venue.market_orders();
        assert_eq!(markets.len(), 2);
        // First the reduce-only close of the long...
        assert!(markets[0].reduce_only);
        assert_eq!(markets[0].side, Side::Sell);
        assert_eq!(markets[0].position_side, PositionSide::Long);
        // ...then the short open.
        assert!(!markets[1].reduce_only);
        assert_eq!(markets[1].position_side, PositionSide::Short);
    }

    #[tokio::test]
    async fn close_cooldown_blocks_follow_up_sell() {
        let venue = Arc::new(MockVenue::with_equity(1000.0));
        *venue.positions.lock() = vec![long_position(0.5)];
        let exec = executor(venue.clone());

        let first = exec.execute_signal(signal(6, SignalKind::Sell, 80)).await;
        assert_eq!(first, ExecuteOutcome::Filled);

        // The venue still reports a long (mock state is static); a SELL ten
        // seconds later must bounce off the 30 s close cooldown.
        let second = exec.execute_signal(signal(7, SignalKind::Sell, 80)).await;
        assert_eq!(second, ExecuteOutcome::Skipped("close-cooldown".to_string()));
        assert_eq!(venue.market_orders().len(), 1);
    }

    #[tokio::test]
    async fn supervisor_close_bypasses_close_cooldown() {
        let venue = Arc::new(MockVenue::with_equity(1000.0));
        let exec = executor(venue.clone());
        exec.cooldowns
            .arm(&btc(), CooldownKind::Close, chrono::Duration::seconds(30));

        let intent = CloseIntent {
            symbol: btc(),
            position_side: PositionSide::Long,
            qty: 0.5,
            reason: CloseReason::Sl,
            trigger_price: 98.0,
        };
        let outcome = exec.close_position(intent).await;
        assert_eq!(outcome, ExecuteOutcome::Filled);
        assert_eq!(venue.market_orders().len(), 1);
    }

    #[tokio::test]
    async fn orphan_sweep_cancels_only_positionless_protection() {
        let venue = Arc::new(MockVenue::with_equity(1000.0));
        *venue.positions.lock() = vec![long_position(0.5)];
        *venue.open_orders.lock() = vec![
            OrderAck {
                order_id: "1".into(),
                client_id: "tp:9".into(),
                symbol: btc(),
                side: Side::Sell,
                position_side: PositionSide::Long,
                status: "NEW".into(),
                avg_price: 0.0,
                executed_qty: 0.0,
            },
            OrderAck {
                order_id: "2".into(),
                client_id: "sl:8".into(),
                symbol: Symbol::parse("ETHUSDT").unwrap(),
                side: Side::Sell,
                position_side: PositionSide::Long,
                status: "NEW".into(),
                avg_price: 0.0,
                executed_qty: 0.0,
            },
        ];
        let exec = executor(venue.clone());
        exec.sweep_orphans().await;

        // Only the ETH order (no matching position) is canceled.
        let cancels = venue.cancels.lock();
        assert_eq!(cancels.as_slice(), ["sl:8"]);
    }

    #[tokio::test]
    async fn hold_never_reaches_the_venue() {
        let venue = Arc::new(MockVenue::with_equity(1000.0));
        let exec = executor(venue.clone());
        let outcome = exec.execute_signal(signal(9, SignalKind::Hold, 90)).await;
        assert_eq!(outcome, ExecuteOutcome::Skipped("hold".to_string()));
        assert!(venue.orders.lock().is_empty());
    }

    #[test]
    fn price_hint_parsing() {
        assert_eq!(parse_price_hint("tp_price: 50210.5, rest", "tp_price"), Some(50210.5));
        assert_eq!(parse_price_hint("no numbers here", "tp_price"), None);
        assert_eq!(parse_price_hint("", "sl"), None);
    }
}
