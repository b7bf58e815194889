// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Quorum engine. Every tunable parameter
// lives here so that the engine can be reconfigured at runtime without a
// restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
//
// The risk gate takes a full clone of this struct at gate entry; a config
// change mid-signal never mixes old and new thresholds.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{SignalKind, TradingMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
        "BNBUSDT".to_string(),
        "XRPUSDT".to_string(),
    ]
}

fn default_hot_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_signal_cooldown_secs() -> u64 {
    300
}

fn default_role_timeout_secs() -> u64 {
    45
}

fn default_referee_timeout_secs() -> u64 {
    90
}

fn default_debate_total_timeout_secs() -> u64 {
    120
}

fn default_snapshot_stale_secs() -> u64 {
    60
}

fn default_chat_model() -> String {
    "deepseek-chat".to_string()
}

fn default_reasoner_model() -> String {
    "deepseek-reasoner".to_string()
}

fn default_llm_base_url() -> String {
    "https://api.deepseek.com/v1".to_string()
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f64 {
    0.7
}

fn default_daily_call_limit() -> u32 {
    500
}

fn default_model_prices() -> HashMap<String, ModelPrice> {
    let mut m = HashMap::new();
    m.insert(
        default_chat_model(),
        ModelPrice { price_in_per_1k: 0.000_27, price_out_per_1k: 0.001_10 },
    );
    m.insert(
        default_reasoner_model(),
        ModelPrice { price_in_per_1k: 0.000_55, price_out_per_1k: 0.002_19 },
    );
    m
}

fn default_amount_usdt() -> f64 {
    200.0
}

fn default_max_position_usdt() -> f64 {
    1000.0
}

fn default_amount_pct() -> f64 {
    3.0
}

fn default_max_position_pct() -> f64 {
    20.0
}

fn default_leverage() -> u32 {
    5
}

fn default_margin_mode() -> String {
    "cross".to_string()
}

fn default_close_cooldown_secs() -> u64 {
    30
}

fn default_min_confidence_open() -> u8 {
    60
}

fn default_min_confidence_close() -> u8 {
    55
}

fn default_max_daily_drawdown_pct() -> f64 {
    5.0
}

fn default_loss_streak_limit() -> u32 {
    3
}

fn default_trail_levels() -> [f64; 4] {
    [1.0, 2.0, 3.5, 5.0]
}

fn default_trail_distances() -> [f64; 4] {
    [1.2, 0.9, 0.6, 0.4]
}

fn default_adverse_reversal_pct() -> f64 {
    1.0
}

fn default_tighten_window_secs() -> u64 {
    1800
}

fn default_position_timeout_hours() -> u64 {
    24
}

fn default_static_sl_pct() -> f64 {
    2.0
}

fn default_static_tp_pct() -> f64 {
    4.0
}

fn default_max_ws_clients() -> usize {
    50
}

fn default_ws_send_timeout_secs() -> u64 {
    2
}

fn default_ws_batch_size() -> usize {
    10
}

fn default_ws_ping_interval_secs() -> u64 {
    30
}

fn default_ws_pong_timeout_secs() -> u64 {
    60
}

fn default_ws_auth_window_secs() -> u64 {
    5
}

fn default_hot_interval_secs() -> u64 {
    300
}

fn default_cold_interval_secs() -> u64 {
    900
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_health_interval_secs() -> u64 {
    60
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

// =============================================================================
// Sub-structures
// =============================================================================

/// Per-1k-token pricing for one model, used for cost estimation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPrice {
    pub price_in_per_1k: f64,
    pub price_out_per_1k: f64,
}

/// What the executor does when a signal opposes an existing position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnOpposite {
    CloseThenOpen,
    CloseOnly,
    Ignore,
}

impl Default for OnOpposite {
    fn default() -> Self {
        Self::CloseThenOpen
    }
}

/// Debate orchestration timing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateParams {
    /// Per-symbol cooldown between successful debates.
    #[serde(default = "default_signal_cooldown_secs")]
    pub signal_cooldown_secs: u64,
    /// Hard per-role LLM call timeout.
    #[serde(default = "default_role_timeout_secs")]
    pub role_timeout_secs: u64,
    /// Referee LLM call timeout (stronger model, longer budget).
    #[serde(default = "default_referee_timeout_secs")]
    pub referee_timeout_secs: u64,
    /// Whole-debate ceiling.
    #[serde(default = "default_debate_total_timeout_secs")]
    pub debate_total_timeout_secs: u64,
    /// Snapshots older than this are refetched.
    #[serde(default = "default_snapshot_stale_secs")]
    pub snapshot_stale_secs: u64,
}

impl Default for DebateParams {
    fn default() -> Self {
        Self {
            signal_cooldown_secs: default_signal_cooldown_secs(),
            role_timeout_secs: default_role_timeout_secs(),
            referee_timeout_secs: default_referee_timeout_secs(),
            debate_total_timeout_secs: default_debate_total_timeout_secs(),
            snapshot_stale_secs: default_snapshot_stale_secs(),
        }
    }
}

/// LLM provider parameters for the chat (roles) and reasoner (referee) tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmParams {
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_reasoner_model")]
    pub reasoner_model: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Per-day LLM call budget across all models.
    #[serde(default = "default_daily_call_limit")]
    pub daily_call_limit: u32,
    /// Per-model pricing used by the cost accountant.
    #[serde(default = "default_model_prices")]
    pub model_prices: HashMap<String, ModelPrice>,
}

impl Default for LlmParams {
    fn default() -> Self {
        Self {
            chat_model: default_chat_model(),
            reasoner_model: default_reasoner_model(),
            base_url: default_llm_base_url(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            daily_call_limit: default_daily_call_limit(),
            model_prices: default_model_prices(),
        }
    }
}

/// Sizing and order-intent parameters for the trade executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeParams {
    /// Flat quote-currency budget per position.
    #[serde(default = "default_amount_usdt")]
    pub amount_usdt: f64,
    /// Hard ceiling in quote currency.
    #[serde(default = "default_max_position_usdt")]
    pub max_position_usdt: f64,
    /// Budget as a percentage of equity.
    #[serde(default = "default_amount_pct")]
    pub amount_pct: f64,
    /// Ceiling as a percentage of equity.
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: f64,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    /// "cross" or "isolated".
    #[serde(default = "default_margin_mode")]
    pub margin_mode: String,
    /// Policy when a signal opposes an existing position.
    #[serde(default)]
    pub on_opposite: OnOpposite,
    #[serde(default)]
    pub allow_pyramiding: bool,
    /// Anti-flap window after a close fill.
    #[serde(default = "default_close_cooldown_secs")]
    pub close_cooldown_secs: u64,
    /// Per-symbol kill switches; symbols listed here are never traded.
    #[serde(default)]
    pub disabled_symbols: Vec<String>,
}

impl Default for TradeParams {
    fn default() -> Self {
        Self {
            amount_usdt: default_amount_usdt(),
            max_position_usdt: default_max_position_usdt(),
            amount_pct: default_amount_pct(),
            max_position_pct: default_max_position_pct(),
            leverage: default_leverage(),
            margin_mode: default_margin_mode(),
            on_opposite: OnOpposite::default(),
            allow_pyramiding: false,
            close_cooldown_secs: default_close_cooldown_secs(),
            disabled_symbols: Vec::new(),
        }
    }
}

/// Risk-gate thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParams {
    #[serde(default = "default_min_confidence_open")]
    pub min_confidence_buy: u8,
    #[serde(default = "default_min_confidence_close")]
    pub min_confidence_sell: u8,
    #[serde(default = "default_min_confidence_open")]
    pub min_confidence_short: u8,
    #[serde(default = "default_min_confidence_close")]
    pub min_confidence_cover: u8,
    /// Realized daily loss cap as a percentage of equity.
    #[serde(default = "default_max_daily_drawdown_pct")]
    pub max_daily_drawdown_pct: f64,
    /// Number of consecutive losing round-trips that blocks new opens.
    #[serde(default = "default_loss_streak_limit")]
    pub loss_streak_limit: u32,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            min_confidence_buy: default_min_confidence_open(),
            min_confidence_sell: default_min_confidence_close(),
            min_confidence_short: default_min_confidence_open(),
            min_confidence_cover: default_min_confidence_close(),
            max_daily_drawdown_pct: default_max_daily_drawdown_pct(),
            loss_streak_limit: default_loss_streak_limit(),
        }
    }
}

impl RiskParams {
    /// Confidence floor for a given signal kind. HOLD has no floor (it never
    /// reaches the gate).
    pub fn confidence_floor(&self, kind: SignalKind) -> u8 {
        match kind {
            SignalKind::Buy => self.min_confidence_buy,
            SignalKind::Sell => self.min_confidence_sell,
            SignalKind::Short => self.min_confidence_short,
            SignalKind::Cover => self.min_confidence_cover,
            SignalKind::Hold => 0,
        }
    }
}

/// Position supervisor parameters: trailing ladder, tighten window, timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorParams {
    /// Favorable-move thresholds L1..L4 (percent, leverage-adjusted),
    /// strictly increasing.
    #[serde(default = "default_trail_levels")]
    pub trail_levels: [f64; 4],
    /// Stop distances from peak D1..D4 (percent), strictly decreasing.
    #[serde(default = "default_trail_distances")]
    pub trail_distances: [f64; 4],
    /// Adverse swing from peak (percent) that triggers the tighten overlay.
    #[serde(default = "default_adverse_reversal_pct")]
    pub adverse_reversal_pct: f64,
    #[serde(default = "default_tighten_window_secs")]
    pub tighten_window_secs: u64,
    /// Positions older than this with no progress past L1 are force-closed.
    #[serde(default = "default_position_timeout_hours")]
    pub position_timeout_hours: u64,
    /// Static stop-loss distance (percent of entry, leverage-adjusted).
    #[serde(default = "default_static_sl_pct")]
    pub static_sl_pct: f64,
    /// Static take-profit distance (percent of entry, leverage-adjusted).
    #[serde(default = "default_static_tp_pct")]
    pub static_tp_pct: f64,
}

impl Default for SupervisorParams {
    fn default() -> Self {
        Self {
            trail_levels: default_trail_levels(),
            trail_distances: default_trail_distances(),
            adverse_reversal_pct: default_adverse_reversal_pct(),
            tighten_window_secs: default_tighten_window_secs(),
            position_timeout_hours: default_position_timeout_hours(),
            static_sl_pct: default_static_sl_pct(),
            static_tp_pct: default_static_tp_pct(),
        }
    }
}

/// Broadcast sink parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastParams {
    #[serde(default = "default_max_ws_clients")]
    pub max_clients: usize,
    #[serde(default = "default_ws_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// Concurrent sends per fan-out batch.
    #[serde(default = "default_ws_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_ws_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_ws_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    /// Unauthenticated clients are dropped after this many seconds.
    #[serde(default = "default_ws_auth_window_secs")]
    pub auth_window_secs: u64,
}

impl Default for BroadcastParams {
    fn default() -> Self {
        Self {
            max_clients: default_max_ws_clients(),
            send_timeout_secs: default_ws_send_timeout_secs(),
            batch_size: default_ws_batch_size(),
            ping_interval_secs: default_ws_ping_interval_secs(),
            pong_timeout_secs: default_ws_pong_timeout_secs(),
            auth_window_secs: default_ws_auth_window_secs(),
        }
    }
}

/// Scheduler cadences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerParams {
    #[serde(default = "default_hot_interval_secs")]
    pub hot_interval_secs: u64,
    #[serde(default = "default_cold_interval_secs")]
    pub cold_interval_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerParams {
    fn default() -> Self {
        Self {
            hot_interval_secs: default_hot_interval_secs(),
            cold_interval_secs: default_cold_interval_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            health_interval_secs: default_health_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Quorum engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Current trading mode: Live, Paused, or Killed.
    #[serde(default)]
    pub trading_mode: TradingMode,

    /// Symbols the engine debates and trades.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Frequent-cadence symbols; also exempt from the quota-critical cull.
    #[serde(default = "default_hot_symbols")]
    pub hot_symbols: Vec<String>,

    #[serde(default)]
    pub debate: DebateParams,
    #[serde(default)]
    pub llm: LlmParams,
    #[serde(default)]
    pub trade: TradeParams,
    #[serde(default)]
    pub risk: RiskParams,
    #[serde(default)]
    pub supervisor: SupervisorParams,
    #[serde(default)]
    pub broadcast: BroadcastParams,
    #[serde(default)]
    pub scheduler: SchedulerParams,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            symbols: default_symbols(),
            hot_symbols: default_hot_symbols(),
            debate: DebateParams::default(),
            llm: LlmParams::default(),
            trade: TradeParams::default(),
            risk: RiskParams::default(),
            supervisor: SupervisorParams::default(),
            broadcast: BroadcastParams::default(),
            scheduler: SchedulerParams::default(),
        }
    }
}

impl RuntimeConfig {
    /// Whether a symbol is in the hot set.
    pub fn is_hot(&self, symbol: &str) -> bool {
        self.hot_symbols.iter().any(|s| s == symbol)
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            trading_mode = %config.trading_mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.debate.role_timeout_secs, 45);
        assert_eq!(cfg.debate.referee_timeout_secs, 90);
        assert_eq!(cfg.debate.debate_total_timeout_secs, 120);
        assert_eq!(cfg.trade.close_cooldown_secs, 30);
        assert_eq!(cfg.trade.on_opposite, OnOpposite::CloseThenOpen);
        assert!(!cfg.trade.allow_pyramiding);
        assert_eq!(cfg.broadcast.max_clients, 50);
        assert_eq!(cfg.broadcast.send_timeout_secs, 2);
        assert_eq!(cfg.scheduler.hot_interval_secs, 300);
        assert_eq!(cfg.scheduler.cold_interval_secs, 900);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.risk.min_confidence_buy, 60);
        assert_eq!(cfg.risk.loss_streak_limit, 3);
        assert_eq!(cfg.supervisor.trail_levels, [1.0, 2.0, 3.5, 5.0]);
        assert_eq!(cfg.supervisor.trail_distances, [1.2, 0.9, 0.6, 0.4]);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "Live", "symbols": ["ETHUSDT"],
                        "trade": { "leverage": 10 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.trade.leverage, 10);
        assert!((cfg.trade.amount_usdt - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.hot_symbols, cfg2.hot_symbols);
        assert_eq!(cfg.trade.on_opposite, cfg2.trade.on_opposite);
    }

    #[test]
    fn confidence_floor_per_kind() {
        let risk = RiskParams::default();
        assert_eq!(risk.confidence_floor(SignalKind::Buy), 60);
        assert_eq!(risk.confidence_floor(SignalKind::Sell), 55);
        assert_eq!(risk.confidence_floor(SignalKind::Hold), 0);
    }

    #[test]
    fn trail_ladder_is_monotone() {
        let sup = SupervisorParams::default();
        for w in sup.trail_levels.windows(2) {
            assert!(w[0] < w[1]);
        }
        for w in sup.trail_distances.windows(2) {
            assert!(w[0] > w[1]);
        }
    }

    #[test]
    fn hot_symbol_lookup() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.is_hot("BTCUSDT"));
        assert!(!cfg.is_hot("DOGEUSDT"));
    }
}
