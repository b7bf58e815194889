// =============================================================================
// Role Panel — analyst personas and prompt construction
// =============================================================================
//
// The panel is data, not code: the orchestrator fans out over whatever specs
// it is handed, so the reference five-role topology is just the default.
//
// Every role shares one market-context block and adds its own directive; the
// referee sees the full panel output and must answer in strict JSON.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::llm::ChatMessage;
use crate::market::MarketSnapshot;
use crate::signal::RoleOpinion;

/// One analyst persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSpec {
    pub name: String,
    pub title: String,
    pub emoji: String,
    /// Role-specific analysis directive appended to the shared base prompt.
    pub directive: String,
}

/// The reference five-role panel.
pub fn default_panel() -> Vec<RoleSpec> {
    vec![
        RoleSpec {
            name: "trend".to_string(),
            title: "趋势猎手".to_string(),
            emoji: "📈".to_string(),
            directive: "你专注于趋势跟随。评估均线排列、MACD 动能与市场状态标签，\
                        只有趋势结构清晰时才给出开仓信号。"
                .to_string(),
        },
        RoleSpec {
            name: "contrarian".to_string(),
            title: "逆向交易员".to_string(),
            emoji: "🔄".to_string(),
            directive: "你专注于反转机会。关注 RSI/KDJ 超买超卖、布林带触碰与大单吸筹，\
                        在市场情绪极端时敢于逆势。"
                .to_string(),
        },
        RoleSpec {
            name: "quant".to_string(),
            title: "量化分析师".to_string(),
            emoji: "📊".to_string(),
            directive: "你只相信数据。严格依据指标数值与统计规律给出结论，\
                        不确定时明确选择观望。"
                .to_string(),
        },
        RoleSpec {
            name: "macro".to_string(),
            title: "宏观观察员".to_string(),
            emoji: "🌍".to_string(),
            directive: "你关注资金面。评估资金费率、持仓量变化与大额成交方向，\
                        判断主力资金意图。"
                .to_string(),
        },
        RoleSpec {
            name: "risk".to_string(),
            title: "风控官".to_string(),
            emoji: "🛡️".to_string(),
            directive: "你是最保守的声音。优先识别当前入场的风险点，\
                        只有风险收益比明显有利时才同意开仓。"
                .to_string(),
        },
    ]
}

// ---------------------------------------------------------------------------
// Prompt construction
// ---------------------------------------------------------------------------

/// Shared market-context block rendered once per debate.
pub fn market_context(snapshot: &MarketSnapshot) -> String {
    let ind = &snapshot.indicators;
    let fmt = |v: Option<f64>| match v {
        Some(x) => format!("{x:.4}"),
        None => "n/a".to_string(),
    };

    let large_trades = if snapshot.large_trades.is_empty() {
        "无".to_string()
    } else {
        snapshot
            .large_trades
            .iter()
            .take(5)
            .map(|t| {
                format!(
                    "{}{}@{}",
                    if t.buyer_is_taker { "买" } else { "卖" },
                    t.qty,
                    t.price
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    };

    format!(
        "交易对: {display} ({raw})\n\
         标记价格: {mark}\n\
         市场状态: {regime}\n\
         RSI(14): {rsi} | MACD: {macd}/{macd_signal} (hist {hist})\n\
         BOLL: {bu}/{bm}/{bl} | KDJ: {k}/{d}/{j}\n\
         ATR%: {atr} | EMA21: {e21} | EMA55: {e55}\n\
         资金费率: {funding} | 持仓量: {oi}\n\
         大单: {large_trades}",
        display = snapshot.symbol.display(),
        raw = snapshot.symbol.raw(),
        mark = snapshot.mark_price,
        regime = snapshot.regime,
        rsi = fmt(ind.rsi_14),
        macd = fmt(ind.macd),
        macd_signal = fmt(ind.macd_signal),
        hist = fmt(ind.macd_histogram),
        bu = fmt(ind.boll_upper),
        bm = fmt(ind.boll_middle),
        bl = fmt(ind.boll_lower),
        k = fmt(ind.kdj_k),
        d = fmt(ind.kdj_d),
        j = fmt(ind.kdj_j),
        atr = fmt(ind.atr_pct),
        e21 = fmt(ind.ema_21),
        e55 = fmt(ind.ema_55),
        funding = snapshot.funding_rate,
        oi = snapshot.open_interest,
        large_trades = large_trades,
    )
}

/// Prompt for one role call.
pub fn role_messages(role: &RoleSpec, snapshot: &MarketSnapshot) -> Vec<ChatMessage> {
    let system = format!(
        "你是{title}({name})，一名加密货币永续合约分析师。{directive}\n\
         用 JSON 回答: {{\"signal\": \"BUY|SELL|SHORT|COVER|HOLD\", \
         \"confidence\": 0-100, \"reason\": \"一句话分析\"}}",
        title = role.title,
        name = role.name,
        directive = role.directive,
    );
    vec![
        ChatMessage::system(system),
        ChatMessage::user(market_context(snapshot)),
    ]
}

/// Prompt for the referee call, built from every role verdict.
pub fn referee_messages(
    snapshot: &MarketSnapshot,
    opinions: &[RoleOpinion],
) -> Vec<ChatMessage> {
    let panel_block = opinions
        .iter()
        .map(|o| {
            format!(
                "{} {} ({}): {} 置信度{} — {}",
                o.emoji, o.title, o.name, o.signal, o.confidence, o.analysis
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let system = "你是首席裁判，综合分析师团队的观点给出最终交易决定。\
                  必须用严格 JSON 回答: {\"signal\": \"BUY|SELL|SHORT|COVER|HOLD\", \
                  \"confidence\": 0-100, \"reason\": \"决策依据\", \
                  \"risk_level\": \"低|中|高\", \"risk_assessment\": \"风险提示\"}"
        .to_string();

    let user = format!(
        "{context}\n\n分析师观点:\n{panel_block}\n\n请给出最终信号。",
        context = market_context(snapshot),
    );

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::snapshot::IndicatorSet;
    use crate::market::Regime;
    use crate::types::{SignalKind, Symbol};

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot {
            symbol: Symbol::parse("BTCUSDT").unwrap(),
            candles: vec![],
            indicators: IndicatorSet {
                rsi_14: Some(55.5),
                macd: Some(12.0),
                macd_signal: Some(10.0),
                macd_histogram: Some(2.0),
                boll_upper: None,
                boll_middle: None,
                boll_lower: None,
                kdj_k: None,
                kdj_d: None,
                kdj_j: None,
                atr_pct: Some(1.2),
                ema_21: None,
                ema_55: None,
            },
            funding_rate: 0.0001,
            open_interest: 50_000.0,
            large_trades: vec![],
            regime: Regime::TrendUp,
            mark_price: 50_000.0,
            created_at: "2025-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn default_panel_has_five_distinct_roles() {
        let panel = default_panel();
        assert_eq!(panel.len(), 5);
        let mut names: Vec<&str> = panel.iter().map(|r| r.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 5);
    }

    #[test]
    fn role_prompt_carries_context_and_directive() {
        let panel = default_panel();
        let msgs = role_messages(&panel[0], &snapshot());
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "system");
        assert!(msgs[0].content.contains(&panel[0].title));
        assert!(msgs[1].content.contains("BTC/USDT:USDT"));
        assert!(msgs[1].content.contains("trend-up"));
        assert!(msgs[1].content.contains("55.5"));
    }

    #[test]
    fn referee_prompt_includes_every_opinion() {
        let opinions = vec![
            RoleOpinion {
                name: "quant".to_string(),
                title: "量化分析师".to_string(),
                emoji: "📊".to_string(),
                model_label: "chat".to_string(),
                signal: SignalKind::Buy,
                confidence: 80,
                analysis: "动能良好".to_string(),
                latency_ms: 900,
                input_messages: vec![],
            },
            RoleOpinion::synthetic_hold(
                "risk", "风控官", "🛡️", "chat", "timeout".to_string(), 45_000, vec![],
            ),
        ];
        let msgs = referee_messages(&snapshot(), &opinions);
        assert_eq!(msgs.len(), 2);
        assert!(msgs[1].content.contains("量化分析师"));
        assert!(msgs[1].content.contains("风控官"));
        assert!(msgs[1].content.contains("置信度80"));
        assert!(msgs[0].content.contains("risk_level"));
    }
}
