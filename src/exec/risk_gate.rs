// =============================================================================
// Risk Gate — ordered pre-execution checks protecting capital
// =============================================================================
//
// A pipeline of boolean checks; the first failure short-circuits and the
// executor records `skipped(reason)` without touching the venue:
//
//   1. trade_enabled       — global or per-symbol kill switch off
//   2. exchange_connected  — venue adapter reports disconnected
//   3. confidence_floor    — confidence below the per-kind floor
//   4. daily_drawdown      — realized PnL today breached the daily cap
//   5. loss_streak         — last K closed round-trips were all losses
//   6. quota_critical      — quota critical and symbol outside the hot set
//   7. cooldown_signal     — directional signal cooldown still active
//   8. min_notional        — computed size under the venue minimum
//
// Thresholds are read from a config snapshot taken at gate entry; a config
// change mid-signal never mixes old and new thresholds.
// =============================================================================

use tracing::warn;

use crate::exec::cooldown::{CooldownKind, CooldownMap};
use crate::exec::sizing::{position_qty, SizingError, SymbolFilters};
use crate::llm::quota::QuotaTier;
use crate::runtime_config::RuntimeConfig;
use crate::signal::Signal;
use crate::types::{SignalKind, TradingMode};

/// Everything the gate reads, captured once at entry.
pub struct GateContext<'a> {
    pub config: &'a RuntimeConfig,
    pub exchange_connected: bool,
    pub equity: f64,
    pub realized_pnl_today: f64,
    /// Consecutive losing round-trips, newest streak.
    pub loss_streak: u32,
    pub quota_tier: QuotaTier,
    pub cooldowns: &'a CooldownMap,
    pub filters: SymbolFilters,
    pub mark_price: f64,
}

/// A failed check: stable reason code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateRejection {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for GateRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Run the full pipeline. `Ok(())` means every check passed.
pub fn evaluate(signal: &Signal, ctx: &GateContext<'_>) -> Result<(), GateRejection> {
    let symbol = &signal.symbol;
    let reject = |code: &'static str, message: String| {
        warn!(symbol = %symbol, signal = %signal.signal, code, %message, "risk gate rejected signal");
        Err(GateRejection { code, message })
    };

    // ── 1. trade_enabled ────────────────────────────────────────────────
    if ctx.config.trading_mode != TradingMode::Live {
        return reject(
            "trade_enabled",
            format!("trading mode is {}", ctx.config.trading_mode),
        );
    }
    if ctx.config.trade.disabled_symbols.iter().any(|s| s == symbol.raw()) {
        return reject("trade_enabled", format!("{symbol} is disabled"));
    }

    // ── 2. exchange_connected ───────────────────────────────────────────
    if !ctx.exchange_connected {
        return reject("exchange_connected", "venue adapter disconnected".to_string());
    }

    // ── 3. confidence_floor ─────────────────────────────────────────────
    let floor = ctx.config.risk.confidence_floor(signal.signal);
    if signal.confidence < floor {
        return reject(
            "confidence_floor",
            format!("confidence {} below floor {}", signal.confidence, floor),
        );
    }

    // ── 4. daily_drawdown ───────────────────────────────────────────────
    let drawdown_cap = -(ctx.config.risk.max_daily_drawdown_pct / 100.0) * ctx.equity;
    if ctx.realized_pnl_today <= drawdown_cap {
        return reject(
            "daily_drawdown",
            format!(
                "realized {:.2} USDT today breaches cap {:.2} USDT",
                ctx.realized_pnl_today, drawdown_cap
            ),
        );
    }

    // ── 5. loss_streak ──────────────────────────────────────────────────
    if ctx.loss_streak >= ctx.config.risk.loss_streak_limit {
        return reject(
            "loss_streak",
            format!(
                "{} consecutive losses (limit {})",
                ctx.loss_streak, ctx.config.risk.loss_streak_limit
            ),
        );
    }

    // ── 6. quota_critical ───────────────────────────────────────────────
    if ctx.quota_tier == QuotaTier::Critical && !ctx.config.is_hot(symbol.raw()) {
        return reject(
            "quota_critical",
            format!("{symbol} is outside the hot set while quota is critical"),
        );
    }

    // ── 7. cooldown_signal ──────────────────────────────────────────────
    // The close cooldown is the executor's own step; the gate only checks
    // the directional open cooldowns.
    let cooldown_kind = match signal.signal {
        SignalKind::Buy => Some(CooldownKind::OpenLong),
        SignalKind::Short => Some(CooldownKind::OpenShort),
        _ => None,
    };
    if let Some(kind) = cooldown_kind {
        if ctx.cooldowns.is_active(symbol, kind) {
            let remaining = ctx
                .cooldowns
                .remaining(symbol, kind)
                .map(|d| d.num_seconds())
                .unwrap_or(0);
            return reject(
                "cooldown_signal",
                format!("{kind} cooldown active for {remaining}s"),
            );
        }
    }

    // ── 8. min_notional ─────────────────────────────────────────────────
    if signal.signal.is_open() {
        if let Err(SizingError::BelowMinNotional) =
            position_qty(&ctx.config.trade, ctx.equity, ctx.mark_price, &ctx.filters)
        {
            return reject(
                "min_notional",
                format!(
                    "computed size under the venue minimum of {:.2} USDT",
                    ctx.filters.min_notional
                ),
            );
        }
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{RoleOpinion, StageTimestamps};
    use crate::types::{RiskLevel, Symbol};
    use chrono::Duration;

    fn live_config() -> RuntimeConfig {
        RuntimeConfig { trading_mode: TradingMode::Live, ..RuntimeConfig::default() }
    }

    fn buy_signal(confidence: u8) -> Signal {
        Signal {
            id: 1,
            symbol: Symbol::parse("BTCUSDT").unwrap(),
            created_at: "2025-01-01T00:00:00Z".to_string(),
            signal: SignalKind::Buy,
            confidence,
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
        }
    }

    fn ctx<'a>(config: &'a RuntimeConfig, cooldowns: &'a CooldownMap) -> GateContext<'a> {
        GateContext {
            config,
            exchange_connected: true,
            equity: 1000.0,
            realized_pnl_today: 0.0,
            loss_streak: 0,
            quota_tier: QuotaTier::Normal,
            cooldowns,
            filters: SymbolFilters::default(),
            mark_price: 100.0,
        }
    }

    #[test]
    fn all_checks_pass() {
        let config = live_config();
        let cooldowns = CooldownMap::new();
        assert!(evaluate(&buy_signal(70), &ctx(&config, &cooldowns)).is_ok());
    }

    #[test]
    fn paused_mode_fails_first_check() {
        let config = RuntimeConfig::default(); // Paused
        let cooldowns = CooldownMap::new();
        let err = evaluate(&buy_signal(70), &ctx(&config, &cooldowns)).unwrap_err();
        assert_eq!(err.code, "trade_enabled");
    }

    #[test]
    fn disabled_symbol_fails() {
        let mut config = live_config();
        config.trade.disabled_symbols.push("BTCUSDT".to_string());
        let cooldowns = CooldownMap::new();
        let err = evaluate(&buy_signal(70), &ctx(&config, &cooldowns)).unwrap_err();
        assert_eq!(err.code, "trade_enabled");
    }

    #[test]
    fn disconnected_exchange_fails() {
        let config = live_config();
        let cooldowns = CooldownMap::new();
        let mut c = ctx(&config, &cooldowns);
        c.exchange_connected = false;
        assert_eq!(evaluate(&buy_signal(70), &c).unwrap_err().code, "exchange_connected");
    }

    #[test]
    fn confidence_floor_applies_per_kind() {
        let config = live_config();
        let cooldowns = CooldownMap::new();
        // Default BUY floor is 60.
        let err = evaluate(&buy_signal(59), &ctx(&config, &cooldowns)).unwrap_err();
        assert_eq!(err.code, "confidence_floor");
        assert!(evaluate(&buy_signal(60), &ctx(&config, &cooldowns)).is_ok());
    }

    #[test]
    fn daily_drawdown_blocks() {
        let config = live_config();
        let cooldowns = CooldownMap::new();
        let mut c = ctx(&config, &cooldowns);
        // Cap: 5% of 1000 = -50.
        c.realized_pnl_today = -50.0;
        assert_eq!(evaluate(&buy_signal(70), &c).unwrap_err().code, "daily_drawdown");
        c.realized_pnl_today = -49.9;
        assert!(evaluate(&buy_signal(70), &c).is_ok());
    }

    #[test]
    fn loss_streak_blocks() {
        let config = live_config();
        let cooldowns = CooldownMap::new();
        let mut c = ctx(&config, &cooldowns);
        c.loss_streak = 3;
        assert_eq!(evaluate(&buy_signal(70), &c).unwrap_err().code, "loss_streak");
    }

    #[test]
    fn quota_critical_spares_hot_symbols() {
        let config = live_config();
        let cooldowns = CooldownMap::new();
        let mut c = ctx(&config, &cooldowns);
        c.quota_tier = QuotaTier::Critical;
        // BTCUSDT is hot by default — passes.
        assert!(evaluate(&buy_signal(70), &c).is_ok());

        let mut cold = buy_signal(70);
        cold.symbol = Symbol::parse("DOGEUSDT").unwrap();
        assert_eq!(evaluate(&cold, &c).unwrap_err().code, "quota_critical");
    }

    #[test]
    fn signal_cooldown_blocks_matching_direction() {
        let config = live_config();
        let cooldowns = CooldownMap::new();
        cooldowns.arm(
            &Symbol::parse("BTCUSDT").unwrap(),
            CooldownKind::OpenLong,
            Duration::seconds(300),
        );
        let err = evaluate(&buy_signal(70), &ctx(&config, &cooldowns)).unwrap_err();
        assert_eq!(err.code, "cooldown_signal");

        // A SHORT is a different direction — not blocked by the long cooldown.
        let mut short = buy_signal(70);
        short.signal = SignalKind::Short;
        assert!(evaluate(&short, &ctx(&config, &cooldowns)).is_ok());
    }

    #[test]
    fn min_notional_blocks_dust_sizing() {
        let config = live_config();
        let cooldowns = CooldownMap::new();
        let mut c = ctx(&config, &cooldowns);
        c.equity = 10.0; // 3% of 10 = 0.3 USDT, under min notional
        assert_eq!(evaluate(&buy_signal(70), &c).unwrap_err().code, "min_notional");
    }

    #[test]
    fn close_intents_skip_sizing_and_open_cooldowns() {
        let config = live_config();
        let cooldowns = CooldownMap::new();
        cooldowns.arm(
            &Symbol::parse("BTCUSDT").unwrap(),
            CooldownKind::OpenLong,
            Duration::seconds(300),
        );
        let mut sell = buy_signal(70);
        sell.signal = SignalKind::Sell;
        let mut c = ctx(&config, &cooldowns);
        c.equity = 10.0; // would fail min_notional for an open
        assert!(evaluate(&sell, &c).is_ok());
    }
}
