// =============================================================================
// Store — rusqlite persistence for signals, trades, cooldowns, budget, locks
// =============================================================================
//
// Write discipline: every table is append-only or monotonic.
//   - signals: insert-only; a signal row is never updated.
//   - trades: insert as pending, then one monotonic status transition.
//   - exec_outcomes: insert-only; the executor's idempotence ledger.
//   - cooldowns: replaced wholesale from the in-memory map snapshot.
//   - daily_budget: read-modify-write keyed by date.
//   - scheduler_locks: TTL rows; expired rows are reapable by any instance.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::exec::cooldown::{CooldownKind, CooldownRow};
use crate::llm::quota::{BudgetSnapshot, QuotaTier};
use crate::signal::{Signal, TradeRecord};
use crate::types::{PositionSide, Side, Symbol, TradeStatus};

// ---------------------------------------------------------------------------
// Round trips
// ---------------------------------------------------------------------------

/// One matched open/close pair, FIFO by `opened_at`.
#[derive(Debug, Clone, Serialize)]
pub struct RoundTrip {
    pub symbol: Symbol,
    pub position_side: PositionSide,
    pub qty: f64,
    pub open_price: f64,
    pub close_price: f64,
    pub pnl_usdt: f64,
    pub opened_at: String,
    pub closed_at: String,
}

/// Aggregate journal statistics over closed round-trips.
#[derive(Debug, Clone, Serialize)]
pub struct JournalStats {
    pub total_round_trips: usize,
    pub win_rate: f64,
    pub total_net_pnl: f64,
    pub profit_factor: f64,
}

/// Pair filled trades into round-trips, FIFO by `opened_at` per
/// `(symbol, position_side)`.
pub fn pair_round_trips(trades: &[TradeRecord]) -> Vec<RoundTrip> {
    use std::collections::{HashMap, VecDeque};

    let mut open_queues: HashMap<(Symbol, PositionSide), VecDeque<&TradeRecord>> = HashMap::new();
    let mut round_trips = Vec::new();

    for trade in trades.iter().filter(|t| t.status == TradeStatus::Filled) {
        let key = (trade.symbol.clone(), trade.position_side);
        let is_open = trade.side == trade.position_side.opening_side();
        if is_open {
            open_queues.entry(key).or_default().push_back(trade);
        } else if let Some(open) = open_queues.entry(key).or_default().pop_front() {
            let direction = match trade.position_side {
                PositionSide::Long => 1.0,
                PositionSide::Short => -1.0,
            };
            round_trips.push(RoundTrip {
                symbol: trade.symbol.clone(),
                position_side: trade.position_side,
                qty: trade.qty,
                open_price: open.price,
                close_price: trade.price,
                pnl_usdt: direction * (trade.price - open.price) * trade.qty,
                opened_at: open.opened_at.clone(),
                closed_at: trade.closed_at.clone().unwrap_or_else(|| trade.opened_at.clone()),
            });
        } else {
            // Close with no tracked open: pre-engine position or manual trade.
            debug!(client_id = %trade.client_id, "close fill without matching open — skipped in pairing");
        }
    }

    round_trips
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// SQLite-backed engine store. All access serialises on one connection.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("failed to open store at {}", path.as_ref().display()))?;
        let store = Self { conn: Mutex::new(conn) };
        store.init()?;
        info!(path = %path.as_ref().display(), "store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let store = Self { conn: Mutex::new(Connection::open_in_memory()?) };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(
                "BEGIN;
                CREATE TABLE IF NOT EXISTS signals (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    symbol TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    signal TEXT NOT NULL,
                    confidence INTEGER NOT NULL,
                    risk_level TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    risk_assessment TEXT NOT NULL,
                    final_raw_output TEXT NOT NULL,
                    role_opinions TEXT NOT NULL,
                    stage_timestamps TEXT NOT NULL,
                    price_at_signal REAL NOT NULL,
                    error_text TEXT,
                    parsed_by_fallback INTEGER NOT NULL DEFAULT 0
                );
                CREATE TABLE IF NOT EXISTS trades (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    order_id TEXT NOT NULL DEFAULT '',
                    client_id TEXT NOT NULL UNIQUE,
                    symbol TEXT NOT NULL,
                    side TEXT NOT NULL,
                    position_side TEXT NOT NULL,
                    price REAL NOT NULL,
                    qty REAL NOT NULL,
                    status TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    pnl_usdt REAL NOT NULL DEFAULT 0,
                    pnl_pct REAL NOT NULL DEFAULT 0,
                    leverage INTEGER NOT NULL DEFAULT 1,
                    opened_at TEXT NOT NULL,
                    closed_at TEXT
                );
                CREATE TABLE IF NOT EXISTS exec_outcomes (
                    signal_id INTEGER PRIMARY KEY,
                    status TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    ts TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS cooldowns (
                    symbol TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    next_allowed_at TEXT NOT NULL,
                    PRIMARY KEY (symbol, kind)
                );
                CREATE TABLE IF NOT EXISTS daily_budget (
                    date TEXT PRIMARY KEY,
                    total_calls INTEGER NOT NULL,
                    calls_by_model TEXT NOT NULL,
                    tokens_in INTEGER NOT NULL,
                    tokens_out INTEGER NOT NULL,
                    estimated_cost REAL NOT NULL,
                    call_limit INTEGER NOT NULL,
                    tier TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS scheduler_locks (
                    task_name TEXT PRIMARY KEY,
                    holder TEXT NOT NULL,
                    expires_at TEXT NOT NULL
                );
                COMMIT;",
            )
            .context("store schema init")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Signals
    // -------------------------------------------------------------------------

    /// Insert a signal and return its monotonic id. Invariants are enforced
    /// here as the last line of defence.
    pub fn insert_signal(&self, signal: &Signal) -> Result<i64> {
        signal
            .check_invariants()
            .map_err(|v| anyhow::anyhow!("signal invariant violated: {v}"))?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO signals (symbol, created_at, signal, confidence, risk_level,
                reason, risk_assessment, final_raw_output, role_opinions,
                stage_timestamps, price_at_signal, error_text, parsed_by_fallback)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                signal.symbol.raw(),
                signal.created_at,
                signal.signal.as_str(),
                signal.confidence as i64,
                signal.risk_level.as_str(),
                signal.reason,
                signal.risk_assessment,
                signal.final_raw_output,
                serde_json::to_string(&signal.role_opinions)?,
                serde_json::to_string(&signal.stage_timestamps)?,
                signal.price_at_signal,
                signal.error_text,
                signal.parsed_by_fallback as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent signals, newest first.
    pub fn recent_signals(&self, limit: usize) -> Result<Vec<Signal>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, symbol, created_at, signal, confidence, risk_level, reason,
                    risk_assessment, final_raw_output, role_opinions, stage_timestamps,
                    price_at_signal, error_text, parsed_by_fallback
             FROM signals ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            let symbol_raw: String = row.get(1)?;
            let signal_str: String = row.get(3)?;
            let risk_str: String = row.get(5)?;
            let opinions_json: String = row.get(9)?;
            let stages_json: String = row.get(10)?;
            Ok((
                row.get::<_, i64>(0)?,
                symbol_raw,
                row.get::<_, String>(2)?,
                signal_str,
                row.get::<_, i64>(4)?,
                risk_str,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                opinions_json,
                stages_json,
                row.get::<_, f64>(11)?,
                row.get::<_, Option<String>>(12)?,
                row.get::<_, i64>(13)? != 0,
            ))
        })?;

        let mut signals = Vec::new();
        for row in rows {
            let (id, symbol_raw, created_at, signal_str, confidence, risk_str, reason,
                 risk_assessment, final_raw_output, opinions_json, stages_json,
                 price_at_signal, error_text, parsed_by_fallback) = row?;

            let Some(symbol) = Symbol::parse(&symbol_raw) else {
                warn!(symbol = %symbol_raw, "skipping signal row with invalid symbol");
                continue;
            };
            let Some(kind) = crate::types::SignalKind::normalize(&signal_str) else {
                warn!(signal = %signal_str, "skipping signal row with invalid kind");
                continue;
            };

            signals.push(Signal {
                id,
                symbol,
                created_at,
                signal: kind,
                confidence: confidence.clamp(0, 100) as u8,
                risk_level: crate::types::RiskLevel::normalize(&risk_str).unwrap_or_default(),
                reason,
                risk_assessment,
                final_raw_output,
                role_opinions: serde_json::from_str(&opinions_json).unwrap_or_default(),
                role_input_messages: Vec::new(),
                final_input_messages: Vec::new(),
                stage_timestamps: serde_json::from_str(&stages_json).unwrap_or_default(),
                price_at_signal,
                daily_quote: None,
                voice_text: None,
                error_text,
                parsed_by_fallback,
            });
        }
        Ok(signals)
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    /// Append a trade row. The unique `client_id` constraint is the dedupe
    /// backstop: a second insert with the same id fails loudly.
    pub fn insert_trade(&self, trade: &TradeRecord) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO trades (order_id, client_id, symbol, side, position_side, price,
                qty, status, reason, pnl_usdt, pnl_pct, leverage, opened_at, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                trade.order_id,
                trade.client_id,
                trade.symbol.raw(),
                trade.side.as_str(),
                trade.position_side.as_str(),
                trade.price,
                trade.qty,
                trade.status.as_str(),
                trade.reason,
                trade.pnl_usdt,
                trade.pnl_pct,
                trade.leverage as i64,
                trade.opened_at,
                trade.closed_at,
            ],
        )?;
        Ok(())
    }

    /// Monotonic status transition for the row with `client_id`. Rejects
    /// transitions out of a terminal state.
    pub fn update_trade_status(
        &self,
        client_id: &str,
        status: TradeStatus,
        order_id: Option<&str>,
        fill_price: Option<f64>,
        pnl_usdt: Option<f64>,
        closed_at: Option<&str>,
    ) -> Result<()> {
        let current = self
            .trade_by_client_id(client_id)?
            .ok_or_else(|| anyhow::anyhow!("no trade row for client_id {client_id}"))?;

        if !current.status.can_transition_to(status) {
            anyhow::bail!(
                "illegal trade status transition {} -> {} for {client_id}",
                current.status,
                status
            );
        }

        self.conn.lock().execute(
            "UPDATE trades SET
                status = ?2,
                order_id = COALESCE(?3, order_id),
                price = COALESCE(?4, price),
                pnl_usdt = COALESCE(?5, pnl_usdt),
                closed_at = COALESCE(?6, closed_at)
             WHERE client_id = ?1",
            params![client_id, status.as_str(), order_id, fill_price, pnl_usdt, closed_at],
        )?;
        Ok(())
    }

    pub fn trade_by_client_id(&self, client_id: &str) -> Result<Option<TradeRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT order_id, client_id, symbol, side, position_side, price, qty, status,
                    reason, pnl_usdt, pnl_pct, leverage, opened_at, closed_at
             FROM trades WHERE client_id = ?1",
        )?;
        stmt.query_row(params![client_id], Self::row_to_trade)
            .optional()
            .context("trade_by_client_id")
    }

    /// All rows still pending (startup reconciliation input).
    pub fn pending_trades(&self) -> Result<Vec<TradeRecord>> {
        self.trades_where("status = 'pending'", usize::MAX)
    }

    /// The most recent `limit` trades, returned in chronological order.
    pub fn recent_trades(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let mut trades = self.trades_where("1=1", limit)?;
        trades.reverse();
        Ok(trades)
    }

    /// All filled trades in insertion order (round-trip pairing input).
    pub fn filled_trades(&self) -> Result<Vec<TradeRecord>> {
        self.trades_where("status = 'filled'", usize::MAX)
    }

    fn trades_where(&self, predicate: &str, limit: usize) -> Result<Vec<TradeRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT order_id, client_id, symbol, side, position_side, price, qty, status,
                    reason, pnl_usdt, pnl_pct, leverage, opened_at, closed_at
             FROM trades WHERE {predicate} ORDER BY id {}",
            if limit == usize::MAX { "ASC".to_string() } else { format!("DESC LIMIT {limit}") }
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::row_to_trade)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn row_to_trade(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRecord> {
        let symbol_raw: String = row.get(2)?;
        let side_str: String = row.get(3)?;
        let pos_str: String = row.get(4)?;
        let status_str: String = row.get(7)?;

        let symbol = Symbol::parse(&symbol_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("invalid symbol '{symbol_raw}'").into(),
            )
        })?;

        Ok(TradeRecord {
            order_id: row.get(0)?,
            client_id: row.get(1)?,
            symbol,
            side: if side_str == "SELL" { Side::Sell } else { Side::Buy },
            position_side: if pos_str == "SHORT" { PositionSide::Short } else { PositionSide::Long },
            price: row.get(5)?,
            qty: row.get(6)?,
            status: match status_str.as_str() {
                "filled" => TradeStatus::Filled,
                "partial" => TradeStatus::Partial,
                "canceled" => TradeStatus::Canceled,
                "failed" => TradeStatus::Failed,
                _ => TradeStatus::Pending,
            },
            reason: row.get(8)?,
            pnl_usdt: row.get(9)?,
            pnl_pct: row.get(10)?,
            leverage: row.get::<_, i64>(11)? as u32,
            opened_at: row.get(12)?,
            closed_at: row.get(13)?,
        })
    }

    // -------------------------------------------------------------------------
    // Derived trade queries
    // -------------------------------------------------------------------------

    /// Length of the current consecutive-loss streak over round-trips,
    /// newest backwards.
    pub fn loss_streak(&self) -> Result<u32> {
        let trades = self.filled_trades()?;
        let round_trips = pair_round_trips(&trades);
        let mut streak = 0;
        for rt in round_trips.iter().rev() {
            if rt.pnl_usdt < 0.0 {
                streak += 1;
            } else {
                break;
            }
        }
        Ok(streak)
    }

    /// Realized PnL over round-trips closed today (UTC).
    pub fn realized_pnl_today(&self) -> Result<f64> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let trades = self.filled_trades()?;
        Ok(pair_round_trips(&trades)
            .iter()
            .filter(|rt| rt.closed_at.starts_with(&today))
            .map(|rt| rt.pnl_usdt)
            .sum())
    }

    /// Aggregate journal statistics over all round-trips.
    pub fn journal_stats(&self) -> Result<Option<JournalStats>> {
        let trades = self.filled_trades()?;
        let round_trips = pair_round_trips(&trades);
        if round_trips.is_empty() {
            return Ok(None);
        }

        let total = round_trips.len();
        let wins = round_trips.iter().filter(|rt| rt.pnl_usdt > 0.0).count();
        let gross_profit: f64 = round_trips.iter().map(|rt| rt.pnl_usdt).filter(|p| *p > 0.0).sum();
        let gross_loss: f64 = round_trips
            .iter()
            .map(|rt| rt.pnl_usdt)
            .filter(|p| *p < 0.0)
            .map(f64::abs)
            .sum();

        Ok(Some(JournalStats {
            total_round_trips: total,
            win_rate: wins as f64 / total as f64,
            total_net_pnl: round_trips.iter().map(|rt| rt.pnl_usdt).sum(),
            profit_factor: if gross_loss > 0.0 {
                gross_profit / gross_loss
            } else if gross_profit > 0.0 {
                f64::INFINITY
            } else {
                0.0
            },
        }))
    }

    // -------------------------------------------------------------------------
    // Executor outcomes (idempotence ledger)
    // -------------------------------------------------------------------------

    pub fn record_outcome(&self, signal_id: i64, status: &str, reason: &str) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO exec_outcomes (signal_id, status, reason, ts)
             VALUES (?1, ?2, ?3, ?4)",
            params![signal_id, status, reason, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn outcome_for(&self, signal_id: i64) -> Result<Option<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT status, reason FROM exec_outcomes WHERE signal_id = ?1")?;
        stmt.query_row(params![signal_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()
            .context("outcome_for")
    }

    // -------------------------------------------------------------------------
    // Cooldowns
    // -------------------------------------------------------------------------

    pub fn save_cooldowns(&self, rows: &[CooldownRow]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM cooldowns", [])?;
        for row in rows {
            tx.execute(
                "INSERT INTO cooldowns (symbol, kind, next_allowed_at) VALUES (?1, ?2, ?3)",
                params![row.symbol.raw(), row.kind.as_str(), row.next_allowed_at.to_rfc3339()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_cooldowns(&self) -> Result<Vec<CooldownRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT symbol, kind, next_allowed_at FROM cooldowns")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (symbol_raw, kind_str, at_str) = row?;
            let (Some(symbol), Some(kind), Ok(at)) = (
                Symbol::parse(&symbol_raw),
                CooldownKind::parse(&kind_str),
                DateTime::parse_from_rfc3339(&at_str),
            ) else {
                warn!(symbol = %symbol_raw, kind = %kind_str, "skipping invalid cooldown row");
                continue;
            };
            out.push(CooldownRow { symbol, kind, next_allowed_at: at.with_timezone(&Utc) });
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Daily budget
    // -------------------------------------------------------------------------

    pub fn upsert_budget(&self, snapshot: &BudgetSnapshot) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO daily_budget
                (date, total_calls, calls_by_model, tokens_in, tokens_out,
                 estimated_cost, call_limit, tier)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                snapshot.date,
                snapshot.total_calls as i64,
                serde_json::to_string(&snapshot.calls_by_model)?,
                snapshot.tokens_in as i64,
                snapshot.tokens_out as i64,
                snapshot.estimated_cost,
                snapshot.limit as i64,
                snapshot.tier.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn load_budget(&self, date: &str) -> Result<Option<BudgetSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT total_calls, calls_by_model, tokens_in, tokens_out, estimated_cost,
                    call_limit, tier
             FROM daily_budget WHERE date = ?1",
        )?;
        stmt.query_row(params![date], |row| {
            let by_model: String = row.get(1)?;
            let tier_str: String = row.get(6)?;
            Ok(BudgetSnapshot {
                date: date.to_string(),
                total_calls: row.get::<_, i64>(0)? as u32,
                calls_by_model: serde_json::from_str(&by_model).unwrap_or_default(),
                tokens_in: row.get::<_, i64>(2)? as u64,
                tokens_out: row.get::<_, i64>(3)? as u64,
                estimated_cost: row.get(4)?,
                limit: row.get::<_, i64>(5)? as u32,
                tier: match tier_str.as_str() {
                    "warn" => QuotaTier::Warn,
                    "critical" => QuotaTier::Critical,
                    "exhausted" => QuotaTier::Exhausted,
                    _ => QuotaTier::Normal,
                },
            })
        })
        .optional()
        .context("load_budget")
    }

    // -------------------------------------------------------------------------
    // Scheduler locks
    // -------------------------------------------------------------------------

    /// Acquire or refresh the named lock. Succeeds when the row is absent,
    /// expired, or already held by `holder`.
    pub fn try_acquire_lock(&self, task_name: &str, holder: &str, ttl_secs: i64) -> Result<bool> {
        let now = Utc::now();
        let expires_at = (now + chrono::Duration::seconds(ttl_secs)).to_rfc3339();
        let conn = self.conn.lock();

        let existing: Option<(String, String)> = conn
            .prepare("SELECT holder, expires_at FROM scheduler_locks WHERE task_name = ?1")?
            .query_row(params![task_name], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;

        let acquirable = match &existing {
            None => true,
            Some((existing_holder, _)) if existing_holder == holder => true,
            Some((_, expiry)) => DateTime::parse_from_rfc3339(expiry)
                .map(|t| t.with_timezone(&Utc) <= now)
                .unwrap_or(true),
        };

        if acquirable {
            conn.execute(
                "INSERT OR REPLACE INTO scheduler_locks (task_name, holder, expires_at)
                 VALUES (?1, ?2, ?3)",
                params![task_name, holder, expires_at],
            )?;
        }
        Ok(acquirable)
    }

    pub fn release_lock(&self, task_name: &str, holder: &str) -> Result<()> {
        self.conn.lock().execute(
            "DELETE FROM scheduler_locks WHERE task_name = ?1 AND holder = ?2",
            params![task_name, holder],
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
