// =============================================================================
// Callback Bus — the only coupling between the debate side and the trade side
// =============================================================================
//
// Three registration slots, each empty or holding exactly one handler
// (last-writer-wins):
//
//   on_signal(Signal)        — broadcast sink subscribes here
//   on_execute(Signal)       — trade executor subscribes here
//   on_price_trigger(...)    — market feed fires this to request a debate
//
// The orchestrator never imports the executor; both import only this bus and
// the shared data types. Handler errors are caught at the bus boundary,
// logged, and never propagate to the producer. For one signal the bus fires
// `on_signal` strictly before `on_execute`, and both complete before the
// orchestrator returns.
// =============================================================================

use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::signal::Signal;
use crate::types::Symbol;

/// Direction of a price-threshold breach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdKind {
    Surge,
    Drop,
}

impl std::fmt::Display for ThresholdKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Surge => write!(f, "surge"),
            Self::Drop => write!(f, "drop"),
        }
    }
}

/// Async handler over a shared signal record.
pub type SignalHandler =
    Arc<dyn Fn(Arc<Signal>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Handler for price-threshold triggers.
pub type PriceTriggerHandler =
    Arc<dyn Fn(Symbol, f64, ThresholdKind) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// The three slots. Registration is last-writer-wins; firing an empty slot is
/// a no-op, not an error.
#[derive(Default)]
pub struct CallbackBus {
    on_signal: RwLock<Option<SignalHandler>>,
    on_execute: RwLock<Option<SignalHandler>>,
    on_price_trigger: RwLock<Option<PriceTriggerHandler>>,
}

impl CallbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Registration ────────────────────────────────────────────────────

    pub fn set_on_signal(&self, handler: SignalHandler) {
        *self.on_signal.write() = Some(handler);
    }

    pub fn set_on_execute(&self, handler: SignalHandler) {
        *self.on_execute.write() = Some(handler);
    }

    pub fn set_on_price_trigger(&self, handler: PriceTriggerHandler) {
        *self.on_price_trigger.write() = Some(handler);
    }

    /// Empty every slot (shutdown).
    pub fn clear(&self) {
        *self.on_signal.write() = None;
        *self.on_execute.write() = None;
        *self.on_price_trigger.write() = None;
    }

    /// Slot population, in declaration order. Startup tests assert this.
    pub fn slots_populated(&self) -> (bool, bool, bool) {
        (
            self.on_signal.read().is_some(),
            self.on_execute.read().is_some(),
            self.on_price_trigger.read().is_some(),
        )
    }

    // ── Invocation ──────────────────────────────────────────────────────

    /// Fire `on_signal`. Errors are logged, never propagated.
    pub async fn emit_signal(&self, signal: Arc<Signal>) {
        let handler = self.on_signal.read().clone();
        match handler {
            Some(h) => {
                if let Err(e) = h(signal.clone()).await {
                    warn!(signal_id = signal.id, error = %e, "on_signal handler failed");
                }
            }
            None => debug!(signal_id = signal.id, "on_signal slot empty — skipped"),
        }
    }

    /// Fire `on_execute`. The executor's venue call is awaited in here;
    /// errors are logged, never propagated.
    pub async fn emit_execute(&self, signal: Arc<Signal>) {
        let handler = self.on_execute.read().clone();
        match handler {
            Some(h) => {
                if let Err(e) = h(signal.clone()).await {
                    warn!(signal_id = signal.id, error = %e, "on_execute handler failed");
                }
            }
            None => debug!(signal_id = signal.id, "on_execute slot empty — skipped"),
        }
    }

    /// Fire `on_price_trigger`. Invoked from the market feed's dispatch loop;
    /// the handler typically enqueues a manual debate.
    pub async fn emit_price_trigger(&self, symbol: Symbol, price: f64, kind: ThresholdKind) {
        let handler = self.on_price_trigger.read().clone();
        match handler {
            Some(h) => {
                if let Err(e) = h(symbol.clone(), price, kind).await {
                    warn!(symbol = %symbol, %kind, error = %e, "on_price_trigger handler failed");
                }
            }
            None => debug!(symbol = %symbol, "on_price_trigger slot empty — skipped"),
        }
    }
}

impl std::fmt::Debug for CallbackBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (s, e, p) = self.slots_populated();
        f.debug_struct("CallbackBus")
            .field("on_signal", &s)
            .field("on_execute", &e)
            .field("on_price_trigger", &p)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{RoleOpinion, StageTimestamps};
    use crate::types::{RiskLevel, SignalKind};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_signal() -> Arc<Signal> {
        Arc::new(Signal {
            id: 7,
            symbol: Symbol::parse("BTCUSDT").unwrap(),
            created_at: "2025-01-01T00:00:00Z".to_string(),
            signal: SignalKind::Buy,
            confidence: 70,
            risk_level: RiskLevel::Medium,
            reason: "test".to_string(),
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

    fn counting_handler(counter: Arc<AtomicU32>) -> SignalHandler {
        Arc::new(move |_signal| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn empty_slot_is_noop() {
        let bus = CallbackBus::new();
        bus.emit_signal(test_signal()).await;
        bus.emit_execute(test_signal()).await;
        bus.emit_price_trigger(Symbol::parse("BTCUSDT").unwrap(), 1.0, ThresholdKind::Surge)
            .await;
    }

    #[tokio::test]
    async fn registering_twice_keeps_only_second() {
        let bus = CallbackBus::new();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        bus.set_on_signal(counting_handler(first.clone()));
        bus.set_on_signal(counting_handler(second.clone()));

        bus.emit_signal(test_signal()).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_error_does_not_propagate() {
        let bus = CallbackBus::new();
        bus.set_on_execute(Arc::new(|_signal| {
            Box::pin(async { anyhow::bail!("venue exploded") })
        }));
        // Must not panic or return an error to the caller.
        bus.emit_execute(test_signal()).await;
    }

    #[tokio::test]
    async fn clear_empties_every_slot() {
        let bus = CallbackBus::new();
        bus.set_on_signal(counting_handler(Arc::new(AtomicU32::new(0))));
        bus.set_on_execute(counting_handler(Arc::new(AtomicU32::new(0))));
        bus.set_on_price_trigger(Arc::new(|_, _, _| Box::pin(async { Ok(()) })));

        assert_eq!(bus.slots_populated(), (true, true, true));
        bus.clear();
        assert_eq!(bus.slots_populated(), (false, false, false));
    }

    #[tokio::test]
    async fn price_trigger_receives_arguments() {
        let bus = CallbackBus::new();
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let seen_clone = seen.clone();
        bus.set_on_price_trigger(Arc::new(move |symbol, price, kind| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                *seen.lock() = Some((symbol, price, kind));
                Ok(())
            })
        }));

        bus.emit_price_trigger(Symbol::parse("ETHUSDT").unwrap(), 2345.5, ThresholdKind::Drop)
            .await;

        let got = seen.lock().clone().unwrap();
        assert_eq!(got.0.raw(), "ETHUSDT");
        assert!((got.1 - 2345.5).abs() < 1e-9);
        assert_eq!(got.2, ThresholdKind::Drop);
    }
}
