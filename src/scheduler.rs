// =============================================================================
// Scheduler — periodic triggers with named singleton locks
// =============================================================================
//
// Cadences:
//   - hot symbols: every `hot_interval_secs` (default 5 min)
//   - cold symbols: every `cold_interval_secs` (default 15 min)
//   - orphan-order sweep: every 5 min, 5 s initial delay
//   - daily budget rollover: at local midnight
//   - health log + state persistence: every 60 s
//
// Singleton discipline: each periodic task takes a named lock row with
// TTL = 2x its own period before running, refreshing on every pass. When
// several instances share the database only the lock holder fires; expired
// rows are reapable, so a crashed holder is replaced within one period.
//
// On shutdown every loop observes the watch channel and returns; main awaits
// them under the configured grace.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Timelike};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::debate::{DebateError, DebateOrchestrator};
use crate::exec::TradeExecutor;
use crate::types::{DebateTrigger, Symbol};

/// Initial delay before the first orphan sweep.
const SWEEP_INITIAL_DELAY_SECS: u64 = 5;

pub struct Scheduler {
    instance_id: String,
    state: Arc<AppState>,
    orchestrator: Arc<DebateOrchestrator>,
    executor: Arc<TradeExecutor>,
}

impl Scheduler {
    pub fn new(
        state: Arc<AppState>,
        orchestrator: Arc<DebateOrchestrator>,
        executor: Arc<TradeExecutor>,
    ) -> Self {
        let instance_id = uuid::Uuid::new_v4().to_string();
        info!(instance = %instance_id, "scheduler initialised");
        Self { instance_id, state, orchestrator, executor }
    }

    /// Spawn every periodic loop; the handles are awaited at shutdown.
    pub fn spawn_all(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().debate_loop(true, shutdown.clone())),
            tokio::spawn(self.clone().debate_loop(false, shutdown.clone())),
            tokio::spawn(self.clone().sweep_loop(shutdown.clone())),
            tokio::spawn(self.clone().rollover_loop(shutdown.clone())),
            tokio::spawn(self.health_loop(shutdown)),
        ]
    }

    /// Take (or refresh) the named singleton lock for a task.
    fn hold_lock(&self, task_name: &str, period_secs: u64) -> bool {
        match self
            .state
            .store
            .try_acquire_lock(task_name, &self.instance_id, (period_secs * 2) as i64)
        {
            Ok(acquired) => {
                if !acquired {
                    debug!(task = task_name, "singleton lock held elsewhere — skipping run");
                }
                acquired
            }
            Err(e) => {
                warn!(task = task_name, error = %e, "lock acquisition failed — skipping run");
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Debate cadence
    // -------------------------------------------------------------------------

    async fn debate_loop(self: Arc<Self>, hot: bool, mut shutdown: watch::Receiver<bool>) {
        let (task_name, period) = {
            let config = self.state.config.read();
            if hot {
                ("debate-hot", config.scheduler.hot_interval_secs)
            } else {
                ("debate-cold", config.scheduler.cold_interval_secs)
            }
        };
        let mut ticker = tokio::time::interval(Duration::from_secs(period));
        ticker.tick().await; // the first tick fires immediately — skip it

        info!(task = task_name, period_secs = period, "debate cadence started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!(task = task_name, "debate cadence stopping");
                    return;
                }
            }
            if !self.hold_lock(task_name, period) {
                continue;
            }

            let symbols: Vec<Symbol> = {
                let config = self.state.config.read();
                config
                    .symbols
                    .iter()
                    .filter(|s| config.is_hot(s) == hot)
                    .filter_map(|s| Symbol::parse(s))
                    .collect()
            };

            // Debates across symbols run concurrently; per-symbol ordering
            // is enforced by the cooldown + single-flight snapshot.
            let mut join_set = tokio::task::JoinSet::new();
            for symbol in symbols {
                let orchestrator = self.orchestrator.clone();
                let state = self.state.clone();
                join_set.spawn(async move {
                    match orchestrator.run_debate(&symbol, DebateTrigger::Scheduled).await {
                        Ok(signal) => {
                            state.increment_version();
                            debug!(symbol = %symbol, id = signal.id, "scheduled debate done");
                        }
                        Err(
                            DebateError::CooldownActive { .. }
                            | DebateError::QuotaExhausted { .. },
                        ) => {
                            // Expected admission skips; already logged at debug.
                        }
                        Err(e) => {
                            warn!(symbol = %symbol, error = %e, "scheduled debate failed");
                            state.push_error(format!("debate {symbol}: {e}"));
                        }
                    }
                });
            }
            while join_set.join_next().await.is_some() {}
        }
    }

    // -------------------------------------------------------------------------
    // Orphan sweep
    // -------------------------------------------------------------------------

    async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.state.config.read().scheduler.sweep_interval_secs;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(SWEEP_INITIAL_DELAY_SECS)) => {}
            _ = shutdown.changed() => return,
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(period));
        info!(period_secs = period, "orphan sweep started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!("orphan sweep stopping");
                    return;
                }
            }
            if !self.hold_lock("orphan-sweep", period) {
                continue;
            }
            self.executor.sweep_orphans().await;
            self.state.cooldowns.purge_expired();
        }
    }

    // -------------------------------------------------------------------------
    // Budget rollover
    // -------------------------------------------------------------------------

    async fn rollover_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let wait = seconds_until_local_midnight();
            debug!(secs = wait, "next budget rollover scheduled");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(wait)) => {}
                _ = shutdown.changed() => {
                    info!("budget rollover stopping");
                    return;
                }
            }
            if !self.hold_lock("budget-rollover", 86_400) {
                continue;
            }

            // Reading the snapshot after midnight performs the reset; persist
            // the fresh row so a restart inside the new day restores zeros.
            let snapshot = self.state.quota.snapshot();
            if let Err(e) = self.state.store.upsert_budget(&snapshot) {
                warn!(error = %e, "budget rollover persist failed");
            } else {
                info!(date = %snapshot.date, "daily budget rolled over");
            }
            self.state.increment_version();
        }
    }

    // -------------------------------------------------------------------------
    // Health log + periodic persistence
    // -------------------------------------------------------------------------

    async fn health_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.state.config.read().scheduler.health_interval_secs;
        let mut ticker = tokio::time::interval(Duration::from_secs(period));
        let mut last_tier = self.state.quota.tier();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!("health loop stopping");
                    return;
                }
            }

            self.executor.probe_venue().await;

            let quota = self.state.quota.snapshot();
            if quota.tier != last_tier {
                warn!(from = %last_tier, to = %quota.tier, "llm quota tier changed");
                self.state
                    .push_error(format!("llm quota tier {last_tier} -> {}", quota.tier));
                last_tier = quota.tier;
            }
            info!(
                uptime_secs = self.state.start_time.elapsed().as_secs(),
                open_positions = self.state.supervisor.open_count(),
                ws_market = self.state.sink.market.len(),
                ws_signals = self.state.sink.signals.len(),
                llm_calls_today = quota.total_calls,
                quota_tier = %quota.tier,
                exchange_connected = self
                    .state
                    .exchange_connected
                    .load(std::sync::atomic::Ordering::Relaxed),
                "engine health"
            );

            // Piggyback durable state on the health cadence.
            if let Err(e) = self.state.store.upsert_budget(&quota) {
                warn!(error = %e, "budget persist failed");
            }
            if let Err(e) = self.state.store.save_cooldowns(&self.state.cooldowns.snapshot()) {
                warn!(error = %e, "cooldown persist failed");
            }
        }
    }
}

/// Seconds until the next local midnight, at least 1.
fn seconds_until_local_midnight() -> u64 {
    let now = Local::now();
    let elapsed_today =
        now.hour() as u64 * 3600 + now.minute() as u64 * 60 + now.second() as u64;
    (86_400 - elapsed_today).max(1)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midnight_delay_is_within_a_day() {
        let secs = seconds_until_local_midnight();
        assert!(secs >= 1);
        assert!(secs <= 86_400);
    }
}
