// =============================================================================
// Quota / Cost Accountant — per-day LLM call and token budget
// =============================================================================
//
// Every LLM call reports (model, tokens_in, tokens_out, latency, ok). The
// accountant keeps a daily counter row and derives the quota tier:
//
//   usage < 80%   -> Normal
//   80 - 90%      -> Warn      (log + WS alert)
//   90 - 100%     -> Critical  (orchestrator drops cold-symbol debates)
//   >= 100%       -> Exhausted (only manual-trigger debates allowed)
//
// Counters reset automatically when the local calendar date rolls over.
// =============================================================================

use std::collections::HashMap;

use chrono::Local;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::runtime_config::ModelPrice;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Quota state ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaTier {
    Normal,
    Warn,
    Critical,
    Exhausted,
}

impl std::fmt::Display for QuotaTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Warn => write!(f, "warn"),
            Self::Critical => write!(f, "critical"),
            Self::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Serialisable snapshot of one day's budget, also the persisted row shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub date: String,
    pub total_calls: u32,
    pub calls_by_model: HashMap<String, u32>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub estimated_cost: f64,
    pub limit: u32,
    pub tier: QuotaTier,
}

// ---------------------------------------------------------------------------
// Accountant
// ---------------------------------------------------------------------------

struct Inner {
    date: String,
    total_calls: u32,
    calls_by_model: HashMap<String, u32>,
    tokens_in: u64,
    tokens_out: u64,
    estimated_cost: f64,
}

impl Inner {
    fn fresh(date: String) -> Self {
        Self {
            date,
            total_calls: 0,
            calls_by_model: HashMap::new(),
            tokens_in: 0,
            tokens_out: 0,
            estimated_cost: 0.0,
        }
    }
}

/// Thread-safe daily LLM budget accountant.
pub struct QuotaAccountant {
    state: RwLock<Inner>,
    limit: u32,
    prices: HashMap<String, ModelPrice>,
}

impl QuotaAccountant {
    pub fn new(limit: u32, prices: HashMap<String, ModelPrice>) -> Self {
        info!(limit, models = prices.len(), "quota accountant initialised");
        Self {
            state: RwLock::new(Inner::fresh(Self::today())),
            limit,
            prices,
        }
    }

    /// Seed counters from a persisted row (startup restore). Ignored when the
    /// row's date is not today.
    pub fn restore(&self, snapshot: &BudgetSnapshot) {
        if snapshot.date != Self::today() {
            debug!(date = %snapshot.date, "stale budget row ignored on restore");
            return;
        }
        let mut s = self.state.write();
        s.total_calls = snapshot.total_calls;
        s.calls_by_model = snapshot.calls_by_model.clone();
        s.tokens_in = snapshot.tokens_in;
        s.tokens_out = snapshot.tokens_out;
        s.estimated_cost = snapshot.estimated_cost;
        info!(calls = s.total_calls, "budget counters restored from store");
    }

    /// Record one LLM call. Failed calls still count against the budget: the
    /// provider billed the attempt.
    pub fn record(&self, model: &str, tokens_in: u32, tokens_out: u32, latency_ms: u64, ok: bool) {
        self.maybe_reset_daily();

        let prev_tier = self.tier();
        {
            let mut s = self.state.write();
            s.total_calls += 1;
            *s.calls_by_model.entry(model.to_string()).or_insert(0) += 1;
            s.tokens_in += tokens_in as u64;
            s.tokens_out += tokens_out as u64;

            if let Some(price) = self.prices.get(model) {
                s.estimated_cost += (tokens_in as f64 / 1000.0) * price.price_in_per_1k
                    + (tokens_out as f64 / 1000.0) * price.price_out_per_1k;
            }
        }

        let tier = self.tier();
        if tier != prev_tier {
            warn!(%tier, prev = %prev_tier, "quota tier changed");
        }
        debug!(model, tokens_in, tokens_out, latency_ms, ok, %tier, "llm call recorded");
    }

    /// Current tier derived from call count vs. the daily limit.
    pub fn tier(&self) -> QuotaTier {
        self.maybe_reset_daily();
        let calls = self.state.read().total_calls;
        if self.limit == 0 {
            return QuotaTier::Normal;
        }
        let usage = calls as f64 / self.limit as f64;
        if usage >= 1.0 {
            QuotaTier::Exhausted
        } else if usage >= 0.90 {
            QuotaTier::Critical
        } else if usage >= 0.80 {
            QuotaTier::Warn
        } else {
            QuotaTier::Normal
        }
    }

    /// Build a serialisable snapshot (dashboard + persistence).
    pub fn snapshot(&self) -> BudgetSnapshot {
        self.maybe_reset_daily();
        let s = self.state.read();
        BudgetSnapshot {
            date: s.date.clone(),
            total_calls: s.total_calls,
            calls_by_model: s.calls_by_model.clone(),
            tokens_in: s.tokens_in,
            tokens_out: s.tokens_out,
            estimated_cost: s.estimated_cost,
            limit: self.limit,
            tier: if self.limit == 0 {
                QuotaTier::Normal
            } else {
                let usage = s.total_calls as f64 / self.limit as f64;
                if usage >= 1.0 {
                    QuotaTier::Exhausted
                } else if usage >= 0.90 {
                    QuotaTier::Critical
                } else if usage >= 0.80 {
                    QuotaTier::Warn
                } else {
                    QuotaTier::Normal
                }
            },
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn today() -> String {
        Local::now().format("%Y-%m-%d").to_string()
    }

    /// Reset all counters when the local date has rolled over since the last
    /// check.
    fn maybe_reset_daily(&self) {
        let today = Self::today();
        {
            let s = self.state.read();
            if s.date == today {
                return;
            }
        }
        let mut s = self.state.write();
        // Double-check after acquiring the write lock.
        if s.date != today {
            info!(old_date = %s.date, new_date = %today, "date rolled — resetting daily budget");
            *s = Inner::fresh(today);
        }
    }
}

impl std::fmt::Debug for QuotaAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.read();
        f.debug_struct("QuotaAccountant")
            .field("date", &s.date)
            .field("total_calls", &s.total_calls)
            .field("limit", &self.limit)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn accountant(limit: u32) -> QuotaAccountant {
        let mut prices = HashMap::new();
        prices.insert(
            "chat".to_string(),
            ModelPrice { price_in_per_1k: 0.001, price_out_per_1k: 0.002 },
        );
        QuotaAccountant::new(limit, prices)
    }

    #[test]
    fn tier_ladder() {
        let acc = accountant(10);
        assert_eq!(acc.tier(), QuotaTier::Normal);

        for _ in 0..7 {
            acc.record("chat", 100, 50, 10, true);
        }
        assert_eq!(acc.tier(), QuotaTier::Normal); // 70%

        acc.record("chat", 100, 50, 10, true);
        assert_eq!(acc.tier(), QuotaTier::Warn); // 80%

        acc.record("chat", 100, 50, 10, true);
        assert_eq!(acc.tier(), QuotaTier::Critical); // 90%

        acc.record("chat", 100, 50, 10, false);
        assert_eq!(acc.tier(), QuotaTier::Exhausted); // 100%
    }

    #[test]
    fn cost_estimation_uses_model_prices() {
        let acc = accountant(100);
        acc.record("chat", 1000, 500, 10, true);
        let snap = acc.snapshot();
        // 1.0 * 0.001 + 0.5 * 0.002
        assert!((snap.estimated_cost - 0.002).abs() < 1e-9);
        assert_eq!(snap.tokens_in, 1000);
        assert_eq!(snap.tokens_out, 500);
        assert_eq!(snap.calls_by_model.get("chat"), Some(&1));
    }

    #[test]
    fn unknown_model_counts_calls_without_cost() {
        let acc = accountant(100);
        acc.record("mystery", 1000, 1000, 5, true);
        let snap = acc.snapshot();
        assert_eq!(snap.total_calls, 1);
        assert_eq!(snap.estimated_cost, 0.0);
    }

    #[test]
    fn restore_ignores_stale_date() {
        let acc = accountant(100);
        let stale = BudgetSnapshot {
            date: "1999-01-01".to_string(),
            total_calls: 42,
            calls_by_model: HashMap::new(),
            tokens_in: 1,
            tokens_out: 1,
            estimated_cost: 1.0,
            limit: 100,
            tier: QuotaTier::Normal,
        };
        acc.restore(&stale);
        assert_eq!(acc.snapshot().total_calls, 0);
    }

    #[test]
    fn zero_limit_never_exhausts() {
        let acc = accountant(0);
        acc.record("chat", 1, 1, 1, true);
        assert_eq!(acc.tier(), QuotaTier::Normal);
    }
}
