// =============================================================================
// Cooldown Map — typed (symbol, action) -> next_allowed_at state
// =============================================================================
//
// Two cooldown classes share the map:
//   - signal cooldowns (per symbol, per direction) prevent duplicate opens;
//   - the close cooldown (per symbol) prevents close-flap for 30 s after a
//     close fill.
//
// All access goes through the typed methods below; no caller touches the
// underlying map. Timestamps are wall-clock so rows survive a restart.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::Symbol;

/// The action a cooldown guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownKind {
    OpenLong,
    OpenShort,
    Close,
}

impl CooldownKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenLong => "open_long",
            Self::OpenShort => "open_short",
            Self::Close => "close",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open_long" => Some(Self::OpenLong),
            "open_short" => Some(Self::OpenShort),
            "close" => Some(Self::Close),
            _ => None,
        }
    }
}

impl std::fmt::Display for CooldownKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted row shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownRow {
    pub symbol: Symbol,
    pub kind: CooldownKind,
    pub next_allowed_at: DateTime<Utc>,
}

/// Thread-safe cooldown state for every `(symbol, action)` pair.
#[derive(Default)]
pub struct CooldownMap {
    inner: RwLock<HashMap<(Symbol, CooldownKind), DateTime<Utc>>>,
}

impl CooldownMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore persisted rows (startup). Expired rows are dropped.
    pub fn restore(&self, rows: Vec<CooldownRow>) {
        let now = Utc::now();
        let mut map = self.inner.write();
        for row in rows {
            if row.next_allowed_at > now {
                map.insert((row.symbol, row.kind), row.next_allowed_at);
            }
        }
        debug!(active = map.len(), "cooldown rows restored");
    }

    /// Arm the cooldown unconditionally (used after fills and successful
    /// debates).
    pub fn arm(&self, symbol: &Symbol, kind: CooldownKind, duration: Duration) {
        let until = Utc::now() + duration;
        self.inner.write().insert((symbol.clone(), kind), until);
        debug!(symbol = %symbol, %kind, until = %until, "cooldown armed");
    }

    /// Arm only when no cooldown is currently active for the key. Returns
    /// whether the arm happened.
    pub fn try_arm(&self, symbol: &Symbol, kind: CooldownKind, duration: Duration) -> bool {
        let now = Utc::now();
        let mut map = self.inner.write();
        let key = (symbol.clone(), kind);
        if map.get(&key).is_some_and(|until| *until > now) {
            return false;
        }
        map.insert(key, now + duration);
        true
    }

    /// Whether the cooldown for `(symbol, kind)` is active.
    pub fn is_active(&self, symbol: &Symbol, kind: CooldownKind) -> bool {
        let now = Utc::now();
        self.inner
            .read()
            .get(&(symbol.clone(), kind))
            .is_some_and(|until| *until > now)
    }

    /// Whether either directional signal cooldown is active for `symbol`.
    pub fn any_signal_active(&self, symbol: &Symbol) -> bool {
        self.is_active(symbol, CooldownKind::OpenLong)
            || self.is_active(symbol, CooldownKind::OpenShort)
    }

    /// Remaining time, or `None` when inactive.
    pub fn remaining(&self, symbol: &Symbol, kind: CooldownKind) -> Option<Duration> {
        let now = Utc::now();
        let until = *self.inner.read().get(&(symbol.clone(), kind))?;
        (until > now).then(|| until - now)
    }

    /// Active rows for persistence.
    pub fn snapshot(&self) -> Vec<CooldownRow> {
        let now = Utc::now();
        self.inner
            .read()
            .iter()
            .filter(|(_, until)| **until > now)
            .map(|((symbol, kind), until)| CooldownRow {
                symbol: symbol.clone(),
                kind: *kind,
                next_allowed_at: *until,
            })
            .collect()
    }

    /// Drop expired entries; called from the periodic sweep.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut map = self.inner.write();
        let before = map.len();
        map.retain(|_, until| *until > now);
        before - map.len()
    }
}

impl std::fmt::Debug for CooldownMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooldownMap")
            .field("entries", &self.inner.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn btc() -> Symbol {
        Symbol::parse("BTCUSDT").unwrap()
    }

    #[test]
    fn arm_then_active_then_remaining() {
        let map = CooldownMap::new();
        assert!(!map.is_active(&btc(), CooldownKind::Close));

        map.arm(&btc(), CooldownKind::Close, Duration::seconds(30));
        assert!(map.is_active(&btc(), CooldownKind::Close));

        let remaining = map.remaining(&btc(), CooldownKind::Close).unwrap();
        assert!(remaining <= Duration::seconds(30));
        assert!(remaining > Duration::seconds(25));
    }

    #[test]
    fn try_arm_refuses_while_active() {
        let map = CooldownMap::new();
        assert!(map.try_arm(&btc(), CooldownKind::OpenLong, Duration::seconds(60)));
        assert!(!map.try_arm(&btc(), CooldownKind::OpenLong, Duration::seconds(60)));
    }

    #[test]
    fn expired_entries_are_inactive_and_purged() {
        let map = CooldownMap::new();
        map.arm(&btc(), CooldownKind::OpenShort, Duration::seconds(-1));
        assert!(!map.is_active(&btc(), CooldownKind::OpenShort));
        assert!(map.remaining(&btc(), CooldownKind::OpenShort).is_none());
        assert_eq!(map.purge_expired(), 1);
    }

    #[test]
    fn any_signal_active_covers_both_directions() {
        let map = CooldownMap::new();
        assert!(!map.any_signal_active(&btc()));
        map.arm(&btc(), CooldownKind::OpenShort, Duration::seconds(60));
        assert!(map.any_signal_active(&btc()));
        // Close cooldown does not count as a signal cooldown.
        let map = CooldownMap::new();
        map.arm(&btc(), CooldownKind::Close, Duration::seconds(60));
        assert!(!map.any_signal_active(&btc()));
    }

    #[test]
    fn restore_drops_expired_rows() {
        let map = CooldownMap::new();
        map.restore(vec![
            CooldownRow {
                symbol: btc(),
                kind: CooldownKind::OpenLong,
                next_allowed_at: Utc::now() + Duration::seconds(60),
            },
            CooldownRow {
                symbol: btc(),
                kind: CooldownKind::Close,
                next_allowed_at: Utc::now() - Duration::seconds(60),
            },
        ]);
        assert!(map.is_active(&btc(), CooldownKind::OpenLong));
        assert!(!map.is_active(&btc(), CooldownKind::Close));
        assert_eq!(map.snapshot().len(), 1);
    }

    #[test]
    fn per_symbol_isolation() {
        let map = CooldownMap::new();
        map.arm(&btc(), CooldownKind::Close, Duration::seconds(30));
        let eth = Symbol::parse("ETHUSDT").unwrap();
        assert!(!map.is_active(&eth, CooldownKind::Close));
    }
}
