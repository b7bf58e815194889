// =============================================================================
// Quorum Bot — Main Entry Point
// =============================================================================
//
// Startup phases (shutdown runs them in reverse, each under a bounded grace):
//   1. config            6. position supervisor loops
//   2. database          7. callback wiring
//   3. quota accountant  8. scheduler
//   4. venue adapter     9. HTTP surface
//   5. market feeds
//
// The engine starts Paused for safety; an operator flips it Live via
// `POST /api/v1/control/resume`.
//
// Exit codes: 0 clean shutdown, 1 configuration rejected, 2 venue handshake
// failed when required, 3 schema/migration failure, 4 scheduler failure.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broadcast;
mod bus;
mod debate;
mod exec;
mod llm;
mod market;
mod runtime_config;
mod scheduler;
mod schema;
mod signal;
mod store;
mod types;
mod venue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::rest::ApiContext;
use crate::app_state::AppState;
use crate::broadcast::BroadcastSink;
use crate::bus::CallbackBus;
use crate::debate::DebateOrchestrator;
use crate::exec::{CooldownMap, PositionSupervisor, TradeExecutor};
use crate::llm::quota::QuotaAccountant;
use crate::llm::LlmClient;
use crate::market::SnapshotProvider;
use crate::runtime_config::RuntimeConfig;
use crate::scheduler::Scheduler;
use crate::schema::GateStats;
use crate::store::Store;
use crate::types::{DebateTrigger, Symbol, TradingMode};
use crate::venue::VenueClient;

const CONFIG_PATH: &str = "runtime_config.json";
const STORE_PATH: &str = "quorum.db";

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("QUORUM_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Quorum Bot — Starting Up                      ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 1. Configuration ─────────────────────────────────────────────────
    let mut config = match RuntimeConfig::load(CONFIG_PATH) {
        Ok(config) => config,
        Err(e) if !std::path::Path::new(CONFIG_PATH).exists() => {
            warn!(error = %e, "no config file — using defaults");
            RuntimeConfig::default()
        }
        Err(e) => {
            error!(error = %e, "configuration rejected");
            std::process::exit(1);
        }
    };

    // SAFETY: always start Paused; going Live is an explicit operator action.
    config.trading_mode = TradingMode::Paused;

    if let Ok(symbols) = std::env::var("QUORUM_SYMBOLS") {
        config.symbols = symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    let symbols: Vec<Symbol> = config
        .symbols
        .iter()
        .filter_map(|s| Symbol::parse(s))
        .collect();
    if symbols.is_empty() {
        error!(raw = ?config.symbols, "no valid symbols configured");
        std::process::exit(1);
    }
    info!(symbols = ?config.symbols, trading_mode = %config.trading_mode, "configured");

    let config = Arc::new(RwLock::new(config));

    // ── 2. Database ──────────────────────────────────────────────────────
    let store = match Store::open(STORE_PATH) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "store schema init failed");
            std::process::exit(3);
        }
    };

    // ── 3. Quota accountant ──────────────────────────────────────────────
    let quota = {
        let cfg = config.read();
        Arc::new(QuotaAccountant::new(
            cfg.llm.daily_call_limit,
            cfg.llm.model_prices.clone(),
        ))
    };
    let today = chrono::Local::now().format("%Y-%m-%d").to_string();
    match store.load_budget(&today) {
        Ok(Some(row)) => quota.restore(&row),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "budget restore failed"),
    }

    // ── 4. Venue adapter ─────────────────────────────────────────────────
    let venue = match VenueClient::from_env() {
        Ok(venue) => Arc::new(venue),
        Err(e) => {
            error!(error = %e, "venue configuration rejected");
            std::process::exit(2);
        }
    };
    let exchange_connected = Arc::new(AtomicBool::new(false));
    match venue.fetch_balance().await {
        Ok(balance) => {
            exchange_connected.store(true, Ordering::Relaxed);
            info!(available = balance.available, "venue handshake ok");
        }
        Err(e) => {
            if std::env::var("QUORUM_REQUIRE_VENUE").map(|v| v == "1").unwrap_or(false) {
                error!(error = %e, "venue handshake failed and venue is required");
                std::process::exit(2);
            }
            warn!(error = %e, "venue handshake failed — trading gated until reconnect");
        }
    }

    // ── Shared services ──────────────────────────────────────────────────
    let cooldowns = Arc::new(CooldownMap::new());
    match store.load_cooldowns() {
        Ok(rows) => cooldowns.restore(rows),
        Err(e) => warn!(error = %e, "cooldown restore failed"),
    }

    let supervisor = Arc::new(PositionSupervisor::new(config.read().supervisor.clone()));
    let sink = Arc::new(BroadcastSink::new(&config.read().broadcast));
    let bus = Arc::new(CallbackBus::new());
    let gate_stats = Arc::new(GateStats::default());

    let state = Arc::new(AppState::new(
        config.clone(),
        store.clone(),
        quota.clone(),
        cooldowns.clone(),
        supervisor.clone(),
        sink.clone(),
        bus.clone(),
        gate_stats.clone(),
        exchange_connected.clone(),
    ));

    let executor = Arc::new(TradeExecutor::new(
        venue.clone(),
        store.clone(),
        config.clone(),
        cooldowns.clone(),
        supervisor.clone(),
        sink.clone(),
        quota.clone(),
        exchange_connected.clone(),
    ));
    executor.reconcile_startup().await;
    for symbol in &symbols {
        match venue.fetch_symbol_filters(symbol).await {
            Ok(filters) => executor.set_filters(symbol.clone(), filters),
            Err(e) => warn!(symbol = %symbol, error = %e, "filter fetch failed — using defaults"),
        }
    }

    let llm_client = {
        let cfg = config.read();
        Arc::new(LlmClient::new(
            cfg.llm.base_url.clone(),
            std::env::var("QUORUM_LLM_API_KEY").unwrap_or_default(),
        ))
    };
    let snapshots = Arc::new(SnapshotProvider::new(
        venue.clone(),
        Duration::from_secs(config.read().debate.snapshot_stale_secs),
    ));
    let orchestrator = Arc::new(DebateOrchestrator::new(
        llm_client,
        snapshots,
        quota.clone(),
        cooldowns.clone(),
        store.clone(),
        bus.clone(),
        config.clone(),
        gate_stats.clone(),
        debate::roles::default_panel(),
    ));

    // Shutdown signal for every long-running task.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // ── 5. Market feeds ──────────────────────────────────────────────────
    let (tick_tx, tick_rx) = tokio::sync::mpsc::unbounded_channel();
    let mark_url = venue.mark_stream_url(&symbols);
    let mark_handle = tokio::spawn(market::feed::run_mark_stream(
        mark_url,
        tick_tx,
        shutdown_rx.clone(),
    ));

    let (user_tx, mut user_rx) = tokio::sync::mpsc::unbounded_channel();
    let user_handle = tokio::spawn(venue::user_stream::run_user_stream(
        venue.clone(),
        user_tx,
        shutdown_rx.clone(),
    ));
    let user_consumer = {
        let executor = executor.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = user_rx.recv() => match event {
                        Some(event) => executor.on_user_event(event).await,
                        None => return,
                    },
                    _ = shutdown.changed() => return,
                }
            }
        })
    };

    // ── 6. Supervisor loops ──────────────────────────────────────────────
    let dispatcher_handle = tokio::spawn(market::feed::run_tick_dispatcher(
        tick_rx,
        supervisor.clone(),
        executor.clone(),
        bus.clone(),
        sink.clone(),
        state.last_prices.clone(),
        shutdown_rx.clone(),
    ));

    let timeout_handle = {
        let supervisor = supervisor.clone();
        let executor = executor.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => return,
                }
                for intent in supervisor.check_timeouts(chrono::Utc::now()) {
                    let outcome = executor.close_position(intent).await;
                    info!(outcome = %outcome, "timeout close executed");
                }
            }
        })
    };

    let heartbeat_handle = tokio::spawn(sink.clone().run_heartbeat(shutdown_rx.clone()));

    // ── 7. Callback wiring — the declarative slot assignments ────────────
    {
        let sink = sink.clone();
        bus.set_on_signal(Arc::new(move |signal| {
            let sink = sink.clone();
            Box::pin(async move {
                let data = serde_json::to_value(signal.as_ref())?;
                sink.publish_signal(data).await;
                Ok(())
            })
        }));
    }
    {
        let executor = executor.clone();
        bus.set_on_execute(Arc::new(move |signal| {
            let executor = executor.clone();
            Box::pin(async move {
                let outcome = executor.execute_signal(signal).await;
                info!(outcome = %outcome, "signal execution complete");
                Ok(())
            })
        }));
    }
    {
        let orchestrator = orchestrator.clone();
        let state = state.clone();
        bus.set_on_price_trigger(Arc::new(move |symbol, price, kind| {
            let orchestrator = orchestrator.clone();
            let state = state.clone();
            Box::pin(async move {
                info!(symbol = %symbol, price, %kind, "price threshold — debate enqueued");
                match orchestrator
                    .run_debate(&symbol, DebateTrigger::PriceThreshold)
                    .await
                {
                    Ok(_) => {
                        state.increment_version();
                    }
                    Err(e) => {
                        tracing::debug!(symbol = %symbol, error = %e, "price-trigger debate skipped");
                    }
                }
                Ok(())
            })
        }));
    }
    info!(slots = ?bus.slots_populated(), "callback bus wired");

    // ── 8. Scheduler ─────────────────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(
        state.clone(),
        orchestrator.clone(),
        executor.clone(),
    ));
    let scheduler_handles = scheduler.spawn_all(shutdown_rx.clone());

    // ── 9. HTTP surface ──────────────────────────────────────────────────
    let bind_addr = std::env::var("QUORUM_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let router = api::rest::router(ApiContext {
        state: state.clone(),
        orchestrator: orchestrator.clone(),
    });
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "failed to bind API server");
            std::process::exit(1);
        }
    };
    info!(addr = %bind_addr, "API server listening");
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── Graceful shutdown: reverse startup order, bounded grace ──────────
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "signal handler failed");
    }
    warn!("Shutdown signal received — stopping gracefully");

    let grace = Duration::from_secs(config.read().scheduler.shutdown_grace_secs);
    let _ = shutdown_tx.send(true);

    // ── 9. HTTP surface ─────────────────────────────────────────────────
    server_handle.abort();

    // ── 8. Scheduler ────────────────────────────────────────────────────
    let mut scheduler_failed = false;
    for handle in scheduler_handles {
        if !drain_task("scheduler", handle, grace).await {
            scheduler_failed = true;
        }
    }

    // ── 7. Callback slots ───────────────────────────────────────────────
    bus.clear();

    // ── 6. Supervisor loops ─────────────────────────────────────────────
    drain_task("heartbeat", heartbeat_handle, grace).await;
    drain_task("timeout-loop", timeout_handle, grace).await;
    drain_task("tick-dispatcher", dispatcher_handle, grace).await;

    // ── 5. Market feeds ─────────────────────────────────────────────────
    drain_task("user-consumer", user_consumer, grace).await;
    drain_task("user-stream", user_handle, grace).await;
    drain_task("mark-stream", mark_handle, grace).await;

    // ── 4..2. Persist durable state on the way out ──────────────────────
    if let Err(e) = store.save_cooldowns(&cooldowns.snapshot()) {
        error!(error = %e, "cooldown persist on shutdown failed");
    }
    if let Err(e) = store.upsert_budget(&quota.snapshot()) {
        error!(error = %e, "budget persist on shutdown failed");
    }

    // ── 1. Config ───────────────────────────────────────────────────────
    if let Err(e) = config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Quorum Bot shut down complete.");
    if scheduler_failed {
        std::process::exit(4);
    }
}

/// Await one shutdown task under the grace budget. Returns false when the
/// task ended abnormally (panic); overrunning the grace is logged, not
/// blocked on.
async fn drain_task(name: &str, handle: tokio::task::JoinHandle<()>, grace: Duration) -> bool {
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(task = name, error = %e, "task ended abnormally");
            false
        }
        Err(_) => {
            warn!(task = name, "task did not finish within the shutdown grace");
            true
        }
    }
}
