// =============================================================================
// Central Application State — Quorum Engine
// =============================================================================
//
// The single long-lived service container. Every datum that the legacy design
// would keep in module-level mutable state is a field here, established at
// startup and torn down in reverse. Subsystems hold Arc references; AppState
// ties them together and builds the unified snapshot for the REST surface.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::broadcast::BroadcastSink;
use crate::bus::CallbackBus;
use crate::exec::cooldown::CooldownRow;
use crate::exec::supervisor::SupervisedPosition;
use crate::exec::{CooldownMap, PositionSupervisor};
use crate::llm::quota::{BudgetSnapshot, QuotaAccountant};
use crate::runtime_config::RuntimeConfig;
use crate::schema::{GateStats, GateStatsSnapshot};
use crate::store::{JournalStats, Store};
use crate::types::Symbol;

/// Maximum number of recent errors retained for the dashboard.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Central application state shared across all async tasks via
/// `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on every meaningful
    /// mutation.
    pub state_version: AtomicU64,

    pub config: Arc<RwLock<RuntimeConfig>>,
    pub store: Arc<Store>,
    pub quota: Arc<QuotaAccountant>,
    pub cooldowns: Arc<CooldownMap>,
    pub supervisor: Arc<PositionSupervisor>,
    pub sink: Arc<BroadcastSink>,
    pub bus: Arc<CallbackBus>,
    pub gate_stats: Arc<GateStats>,

    /// Whether the venue adapter currently considers itself connected.
    pub exchange_connected: Arc<AtomicBool>,
    /// Latest mark price per symbol, maintained by the tick dispatcher.
    pub last_prices: Arc<RwLock<HashMap<Symbol, f64>>>,

    recent_errors: RwLock<Vec<ErrorRecord>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RwLock<RuntimeConfig>>,
        store: Arc<Store>,
        quota: Arc<QuotaAccountant>,
        cooldowns: Arc<CooldownMap>,
        supervisor: Arc<PositionSupervisor>,
        sink: Arc<BroadcastSink>,
        bus: Arc<CallbackBus>,
        gate_stats: Arc<GateStats>,
        exchange_connected: Arc<AtomicBool>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            config,
            store,
            quota,
            cooldowns,
            supervisor,
            sink,
            bus,
            gate_stats,
            exchange_connected,
            last_prices: Arc::new(RwLock::new(HashMap::new())),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Record an error for the dashboard ring buffer.
    pub fn push_error(&self, message: String) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord { message, at: Utc::now().to_rfc3339() });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    /// Build the serialisable snapshot behind `GET /api/v1/state`.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let config = self.config.read();
        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            trading_mode: config.trading_mode.to_string(),
            symbols: config.symbols.clone(),
            hot_symbols: config.hot_symbols.clone(),
            exchange_connected: self.exchange_connected.load(Ordering::Relaxed),
            last_prices: self
                .last_prices
                .read()
                .iter()
                .map(|(s, p)| (s.raw().to_string(), *p))
                .collect(),
            positions: self.supervisor.snapshot(),
            cooldowns: self.cooldowns.snapshot(),
            quota: self.quota.snapshot(),
            schema_gate: self.gate_stats.snapshot(),
            journal: self.store.journal_stats().ok().flatten(),
            recent_errors: self.recent_errors.read().clone(),
            ws_clients_market: self.sink.market.len(),
            ws_clients_signals: self.sink.signals.len(),
        }
    }
}

/// Full engine state snapshot for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub trading_mode: String,
    pub symbols: Vec<String>,
    pub hot_symbols: Vec<String>,
    pub exchange_connected: bool,
    pub last_prices: HashMap<String, f64>,
    pub positions: Vec<SupervisedPosition>,
    pub cooldowns: Vec<CooldownRow>,
    pub quota: BudgetSnapshot,
    pub schema_gate: GateStatsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal: Option<JournalStats>,
    pub recent_errors: Vec<ErrorRecord>,
    pub ws_clients_market: usize,
    pub ws_clients_signals: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::SupervisorParams;

    fn state() -> AppState {
        AppState::new(
            Arc::new(RwLock::new(RuntimeConfig::default())),
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(QuotaAccountant::new(100, Default::default())),
            Arc::new(CooldownMap::new()),
            Arc::new(PositionSupervisor::new(SupervisorParams::default())),
            Arc::new(BroadcastSink::new(&Default::default())),
            Arc::new(CallbackBus::new()),
            Arc::new(GateStats::default()),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn version_increments() {
        let s = state();
        let v0 = s.current_state_version();
        s.increment_version();
        assert_eq!(s.current_state_version(), v0 + 1);
    }

    #[test]
    fn error_ring_buffer_is_capped() {
        let s = state();
        for i in 0..60 {
            s.push_error(format!("error {i}"));
        }
        let snap = s.build_snapshot();
        assert_eq!(snap.recent_errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(snap.recent_errors.last().unwrap().message, "error 59");
    }

    #[test]
    fn snapshot_serialises() {
        let s = state();
        s.last_prices
            .write()
            .insert(Symbol::parse("BTCUSDT").unwrap(), 50_000.0);
        let json = serde_json::to_value(s.build_snapshot()).unwrap();
        assert_eq!(json["trading_mode"], "Paused");
        assert_eq!(json["last_prices"]["BTCUSDT"], 50_000.0);
        assert!(json["quota"]["tier"].is_string());
    }
}
