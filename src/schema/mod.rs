// =============================================================================
// Schema Gate — coerce free-form LLM text into a validated signal fragment
// =============================================================================
//
// Referee (and role) output arrives as anything from clean JSON to Chinese
// prose with <think> blocks. The gate runs a ranked cascade of extraction
// strategies; each is strictly more tolerant than the previous, so a stricter
// parse is always preferred:
//
//   1. Strip <think>…</think>, direct JSON parse of the remainder.
//   2. Fenced ```json blocks, tried in order (trailing-comma tolerant).
//   3. Largest balanced {…} substring (trailing-comma tolerant).
//   4. Field-level regex extraction, assembling a partial record.
//   5. Chinese verb heuristic (开多/开空/平多/平空/观望 + nearby percent).
//
// Every strategy failure is logged; nothing is swallowed. Validation is
// applied to every candidate: signal normalised to the closed set, confidence
// clamped to [0, 100], risk level defaulted to 中, numeric fields rejected on
// NaN/inf. Records recovered by strategies 4–5 are flagged so downstream
// metrics can observe the fallback rate.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::types::{RiskLevel, SignalKind};

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// Validated signal fragment extracted from LLM text.
#[derive(Debug, Clone, Serialize)]
pub struct ParsedSignal {
    pub signal: SignalKind,
    /// Clamped into [0, 100].
    pub confidence: u8,
    pub reason: String,
    pub risk_level: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tp_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sl_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leverage: Option<u32>,
    /// 1-based index of the strategy that produced this record.
    pub strategy: u8,
    /// Field names recovered by per-field regex rather than a real parse.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub regex_fields: Vec<&'static str>,
}

impl ParsedSignal {
    /// True when only the regex / Chinese-text strategies recovered the
    /// record.
    pub fn parsed_by_fallback(&self) -> bool {
        self.strategy >= 4
    }
}

/// Typed rejection: which strategy produced the offending candidate and a
/// truncated snippet of the input.
#[derive(Debug, Clone, thiserror::Error)]
#[error("schema gate rejected input (strategy {strategy}): {detail} | snippet: {snippet}")]
pub struct ParseFailure {
    pub strategy: u8,
    pub detail: String,
    pub snippet: String,
}

fn snippet_of(input: &str) -> String {
    input.chars().take(160).collect()
}

// ---------------------------------------------------------------------------
// Cascade metrics
// ---------------------------------------------------------------------------

/// Lock-free counters: one success counter per strategy plus total rejects.
#[derive(Debug, Default)]
pub struct GateStats {
    successes: [AtomicU64; 5],
    rejects: AtomicU64,
}

/// Serialisable view of [`GateStats`].
#[derive(Debug, Clone, Serialize)]
pub struct GateStatsSnapshot {
    pub by_strategy: [u64; 5],
    pub rejects: u64,
    /// Share of accepted records that came from strategies 4–5.
    pub fallback_rate: f64,
}

impl GateStats {
    pub fn record_success(&self, strategy: u8) {
        if let Some(c) = self.successes.get((strategy as usize).saturating_sub(1)) {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_reject(&self) {
        self.rejects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GateStatsSnapshot {
        let by_strategy: [u64; 5] =
            std::array::from_fn(|i| self.successes[i].load(Ordering::Relaxed));
        let total: u64 = by_strategy.iter().sum();
        let fallback: u64 = by_strategy[3] + by_strategy[4];
        GateStatsSnapshot {
            by_strategy,
            rejects: self.rejects.load(Ordering::Relaxed),
            fallback_rate: if total > 0 { fallback as f64 / total as f64 } else { 0.0 },
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the extraction cascade over `input`. First strategy to yield a record
/// that survives validation wins.
pub fn parse_signal_text(input: &str) -> Result<ParsedSignal, ParseFailure> {
    let stripped = strip_think_blocks(input);
    let mut last_failure: Option<ParseFailure> = None;

    // ── Strategy 1: direct JSON parse (strict) ──────────────────────────
    match serde_json::from_str::<serde_json::Value>(stripped.trim()) {
        Ok(value) => match validate_value(&value, 1) {
            Ok(parsed) => return Ok(parsed),
            Err(f) => {
                debug!(strategy = 1, detail = %f.detail, "schema gate strategy failed");
                last_failure = Some(f);
            }
        },
        Err(e) => {
            debug!(strategy = 1, error = %e, "schema gate strategy failed");
        }
    }

    // ── Strategy 2: fenced markdown blocks ──────────────────────────────
    for block in fenced_json_blocks(&stripped) {
        match parse_lenient_json(&block) {
            Ok(value) => match validate_value(&value, 2) {
                Ok(parsed) => return Ok(parsed),
                Err(f) => {
                    debug!(strategy = 2, detail = %f.detail, "schema gate strategy failed");
                    last_failure = Some(f);
                }
            },
            Err(e) => {
                debug!(strategy = 2, error = %e, "fenced block did not parse");
            }
        }
    }

    // ── Strategy 3: largest balanced brace substring ────────────────────
    if let Some(candidate) = largest_balanced_object(&stripped) {
        match parse_lenient_json(candidate) {
            Ok(value) => match validate_value(&value, 3) {
                Ok(parsed) => return Ok(parsed),
                Err(f) => {
                    debug!(strategy = 3, detail = %f.detail, "schema gate strategy failed");
                    last_failure = Some(f);
                }
            },
            Err(e) => {
                debug!(strategy = 3, error = %e, "balanced substring did not parse");
            }
        }
    }

    // ── Strategy 4: field-level regex extraction ────────────────────────
    match regex_extract(&stripped) {
        Ok(parsed) => return Ok(parsed),
        Err(f) => {
            debug!(strategy = 4, detail = %f.detail, "schema gate strategy failed");
            last_failure = Some(f);
        }
    }

    // ── Strategy 5: Chinese-text heuristic ──────────────────────────────
    match chinese_heuristic(&stripped) {
        Ok(parsed) => return Ok(parsed),
        Err(f) => {
            debug!(strategy = 5, detail = %f.detail, "schema gate strategy failed");
            last_failure = Some(f);
        }
    }

    Err(last_failure.unwrap_or(ParseFailure {
        strategy: 5,
        detail: "no strategy produced a record".to_string(),
        snippet: snippet_of(input),
    }))
}

// ---------------------------------------------------------------------------
// Pre-processing
// ---------------------------------------------------------------------------

/// Remove every `<think>…</think>` reasoning span.
fn strip_think_blocks(input: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));
    re.replace_all(input, "").into_owned()
}

/// Remove trailing commas before `}` or `]` so near-JSON parses.
fn strip_trailing_commas(input: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r",\s*([}\]])").expect("valid regex"));
    re.replace_all(input, "$1").into_owned()
}

fn parse_lenient_json(input: &str) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::from_str(input.trim())
        .or_else(|_| serde_json::from_str(&strip_trailing_commas(input.trim())))
}

/// Yield the contents of every ```json … ``` (or bare ``` … ```) fence.
fn fenced_json_blocks(input: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("valid regex")
    });
    re.captures_iter(input)
        .map(|c| c[1].trim().to_string())
        .filter(|s| s.starts_with('{'))
        .collect()
}

/// Largest balanced `{…}` substring, string- and escape-aware.
fn largest_balanced_object(input: &str) -> Option<&str> {
    let bytes = input.as_bytes();
    let mut best: Option<(usize, usize)> = None;
    let mut stack: Vec<usize> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => stack.push(i),
            b'}' => {
                if let Some(start) = stack.pop() {
                    let len = i + 1 - start;
                    if best.map_or(true, |(s, e)| len > e - s) {
                        best = Some((start, i + 1));
                    }
                }
            }
            _ => {}
        }
    }

    best.map(|(s, e)| &input[s..e])
}

// ---------------------------------------------------------------------------
// Validation (shared by strategies 1–3)
// ---------------------------------------------------------------------------

/// Coerce a JSON value that may be a number or numeric string into f64,
/// rejecting NaN/inf.
fn coerce_f64(value: &serde_json::Value) -> Option<f64> {
    let n = match value {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().trim_end_matches('%').parse().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn string_field(value: &serde_json::Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(|s| s.trim().to_string())
}

/// Validate a parsed JSON object into a [`ParsedSignal`].
fn validate_value(value: &serde_json::Value, strategy: u8) -> Result<ParsedSignal, ParseFailure> {
    let fail = |detail: String| ParseFailure {
        strategy,
        detail,
        snippet: snippet_of(&value.to_string()),
    };

    let obj = value
        .as_object()
        .ok_or_else(|| fail("top-level value is not an object".to_string()))?;

    let raw_signal = obj
        .get("signal")
        .or_else(|| obj.get("action"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| fail("missing signal field".to_string()))?;

    let signal = SignalKind::normalize(raw_signal)
        .ok_or_else(|| fail(format!("unrecognised signal value '{raw_signal}'")))?;

    let confidence = obj
        .get("confidence")
        .and_then(coerce_f64)
        .ok_or_else(|| fail("missing or non-numeric confidence".to_string()))?
        .clamp(0.0, 100.0)
        .round() as u8;

    let reason = string_field(value, "reason")
        .or_else(|| string_field(value, "analysis"))
        .unwrap_or_default();

    let risk_level = string_field(value, "risk_level")
        .and_then(|s| RiskLevel::normalize(&s))
        .unwrap_or_default();

    let numeric = |key: &str| -> Result<Option<f64>, ParseFailure> {
        match obj.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(v) => coerce_f64(v)
                .map(Some)
                .ok_or_else(|| fail(format!("field {key} is not a finite number"))),
        }
    };

    let tp_price = numeric("tp_price")?;
    let sl_price = numeric("sl_price")?;
    let leverage = numeric("leverage")?.map(|v| v.clamp(1.0, 125.0).round() as u32);

    Ok(ParsedSignal {
        signal,
        confidence,
        reason,
        risk_level,
        risk_assessment: string_field(value, "risk_assessment"),
        tp_price,
        sl_price,
        leverage,
        strategy,
        regex_fields: Vec::new(),
    })
}

// ---------------------------------------------------------------------------
// Strategy 4: per-field regex extraction
// ---------------------------------------------------------------------------

fn field_regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("valid regex"))
}

fn regex_extract(input: &str) -> Result<ParsedSignal, ParseFailure> {
    static SIGNAL_RE: OnceLock<Regex> = OnceLock::new();
    static CONF_RE: OnceLock<Regex> = OnceLock::new();
    static REASON_RE: OnceLock<Regex> = OnceLock::new();
    static RISK_RE: OnceLock<Regex> = OnceLock::new();
    static TP_RE: OnceLock<Regex> = OnceLock::new();
    static SL_RE: OnceLock<Regex> = OnceLock::new();
    static LEV_RE: OnceLock<Regex> = OnceLock::new();

    let fail = |detail: String| ParseFailure {
        strategy: 4,
        detail,
        snippet: snippet_of(input),
    };

    let mut regex_fields: Vec<&'static str> = Vec::new();

    let signal_re = field_regex(
        &SIGNAL_RE,
        r#"(?i)"?signal"?\s*[:=]\s*"?([A-Za-z_]+)"?"#,
    );
    let raw_signal = signal_re
        .captures(input)
        .map(|c| c[1].to_string())
        .ok_or_else(|| fail("no signal field found".to_string()))?;
    let signal = SignalKind::normalize(&raw_signal)
        .ok_or_else(|| fail(format!("unrecognised signal value '{raw_signal}'")))?;
    regex_fields.push("signal");

    let conf_re = field_regex(
        &CONF_RE,
        r#"(?i)"?confidence"?\s*[:=]\s*"?(\d+(?:\.\d+)?)"#,
    );
    let confidence = conf_re
        .captures(input)
        .and_then(|c| c[1].parse::<f64>().ok())
        .ok_or_else(|| fail("no confidence field found".to_string()))?
        .clamp(0.0, 100.0)
        .round() as u8;
    regex_fields.push("confidence");

    let reason_re = field_regex(&REASON_RE, r#""reason"\s*:\s*"((?:[^"\\]|\\.)*)""#);
    let reason = reason_re
        .captures(input)
        .map(|c| c[1].to_string())
        .unwrap_or_default();
    if !reason.is_empty() {
        regex_fields.push("reason");
    }

    let risk_re = field_regex(
        &RISK_RE,
        r#"(?i)"?risk_level"?\s*[:=]\s*"?(低|中|高|low|medium|high)"#,
    );
    let risk_level = risk_re
        .captures(input)
        .and_then(|c| RiskLevel::normalize(&c[1]))
        .unwrap_or_default();

    let parse_num = |re: &Regex| -> Option<f64> {
        re.captures(input)
            .and_then(|c| c[1].parse::<f64>().ok())
            .filter(|v| v.is_finite())
    };

    let tp_price = parse_num(field_regex(
        &TP_RE,
        r#"(?i)"?tp_price"?\s*[:=]\s*"?(\d+(?:\.\d+)?)"#,
    ));
    let sl_price = parse_num(field_regex(
        &SL_RE,
        r#"(?i)"?sl_price"?\s*[:=]\s*"?(\d+(?:\.\d+)?)"#,
    ));
    let leverage = parse_num(field_regex(
        &LEV_RE,
        r#"(?i)"?leverage"?\s*[:=]\s*"?(\d+)"#,
    ))
    .map(|v| v.clamp(1.0, 125.0) as u32);

    Ok(ParsedSignal {
        signal,
        confidence,
        reason,
        risk_level,
        risk_assessment: None,
        tp_price,
        sl_price,
        leverage,
        strategy: 4,
        regex_fields,
    })
}

// ---------------------------------------------------------------------------
// Strategy 5: Chinese-text heuristic
// ---------------------------------------------------------------------------

/// Trading verbs mapped to the closed signal set. Checked in order; close
/// verbs first so "平多" never matches the "多" inside an open verb.
const CN_VERBS: [(&str, SignalKind); 5] = [
    ("平多", SignalKind::Sell),
    ("平空", SignalKind::Cover),
    ("开多", SignalKind::Buy),
    ("开空", SignalKind::Short),
    ("观望", SignalKind::Hold),
];

fn chinese_heuristic(input: &str) -> Result<ParsedSignal, ParseFailure> {
    static PCT_RE: OnceLock<Regex> = OnceLock::new();

    let fail = |detail: String| ParseFailure {
        strategy: 5,
        detail,
        snippet: snippet_of(input),
    };

    let (verb, signal) = CN_VERBS
        .iter()
        .find(|(verb, _)| input.contains(verb))
        .copied()
        .ok_or_else(|| fail("no trading verb found".to_string()))?;

    let pct_re = PCT_RE.get_or_init(|| {
        Regex::new(r"(\d{1,3})\s*%").expect("valid regex")
    });
    let confidence = pct_re
        .captures(input)
        .and_then(|c| c[1].parse::<f64>().ok())
        .map(|v| v.clamp(0.0, 100.0).round() as u8)
        .unwrap_or(50);

    Ok(ParsedSignal {
        signal,
        confidence,
        reason: format!("文本信号: {verb}"),
        risk_level: RiskLevel::default(),
        risk_assessment: None,
        tp_price: None,
        sl_price: None,
        leverage: None,
        strategy: 5,
        regex_fields: vec!["signal", "confidence"],
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy1_clean_json() {
        let input = r#"{"signal":"BUY","confidence":72,"reason":"MACD金叉","risk_level":"中"}"#;
        let parsed = parse_signal_text(input).unwrap();
        assert_eq!(parsed.strategy, 1);
        assert_eq!(parsed.signal, SignalKind::Buy);
        assert_eq!(parsed.confidence, 72);
        assert_eq!(parsed.reason, "MACD金叉");
        assert_eq!(parsed.risk_level, RiskLevel::Medium);
        assert!(!parsed.parsed_by_fallback());
    }

    #[test]
    fn strategy1_strips_think_block() {
        let input = "<think>long deliberation</think>{\"signal\":\"hold\",\"confidence\":40,\"reason\":\"chop\"}";
        let parsed = parse_signal_text(input).unwrap();
        assert_eq!(parsed.strategy, 1);
        assert_eq!(parsed.signal, SignalKind::Hold);
    }

    #[test]
    fn strategy2_fenced_block_with_trailing_comma() {
        // Spec scenario: trailing comma defeats strict parsing, fenced block
        // succeeds after comma-tolerant handling; signal lowercased,
        // confidence as string over 100.
        let input = "<think>weighing</think> ```json\n{\"signal\":\"buy\",\"confidence\":\"102\",\"reason\":\"x\",}\n```";
        let parsed = parse_signal_text(input).unwrap();
        assert_eq!(parsed.strategy, 2);
        assert_eq!(parsed.signal, SignalKind::Buy);
        assert_eq!(parsed.confidence, 100); // clamped
    }

    #[test]
    fn strategy3_embedded_object() {
        let input = "根据综合分析，我的结论如下 {\"signal\": \"SHORT\", \"confidence\": 66, \"reason\": \"趋势转弱\"} 仅供参考。";
        let parsed = parse_signal_text(input).unwrap();
        assert_eq!(parsed.strategy, 3);
        assert_eq!(parsed.signal, SignalKind::Short);
        assert_eq!(parsed.confidence, 66);
    }

    #[test]
    fn strategy3_picks_largest_object() {
        let input = r#"{"a":1} then {"signal":"COVER","confidence":55,"reason":"squeeze done","risk_level":"低"}"#;
        // Strategy 1 fails (two top-level values), 2 has no fences.
        let parsed = parse_signal_text(input).unwrap();
        assert_eq!(parsed.strategy, 3);
        assert_eq!(parsed.signal, SignalKind::Cover);
        assert_eq!(parsed.risk_level, RiskLevel::Low);
    }

    #[test]
    fn strategy4_regex_fields_marked() {
        let input = "signal: BUY\nconfidence: 63\nleverage: 5\nno json here at all";
        let parsed = parse_signal_text(input).unwrap();
        assert_eq!(parsed.strategy, 4);
        assert!(parsed.parsed_by_fallback());
        assert!(parsed.regex_fields.contains(&"signal"));
        assert!(parsed.regex_fields.contains(&"confidence"));
        assert_eq!(parsed.leverage, Some(5));
    }

    #[test]
    fn strategy5_chinese_prose() {
        let input = "综合各位分析师意见，建议开多，置信度 73%，注意控制仓位。";
        let parsed = parse_signal_text(input).unwrap();
        assert_eq!(parsed.strategy, 5);
        assert_eq!(parsed.signal, SignalKind::Buy);
        assert_eq!(parsed.confidence, 73);
    }

    #[test]
    fn strategy5_close_verb_beats_open_verb() {
        let parsed = parse_signal_text("建议平多 60%").unwrap();
        assert_eq!(parsed.signal, SignalKind::Sell);
        let parsed = parse_signal_text("建议平空 60%").unwrap();
        assert_eq!(parsed.signal, SignalKind::Cover);
    }

    #[test]
    fn rejection_carries_strategy_and_snippet() {
        let err = parse_signal_text("the weather is nice today").unwrap_err();
        assert_eq!(err.strategy, 5);
        assert!(err.snippet.contains("weather"));
    }

    #[test]
    fn unknown_signal_value_rejected() {
        let err = parse_signal_text(r#"{"signal":"MOON","confidence":99,"reason":"x"}"#)
            .unwrap_err();
        assert!(err.detail.contains("MOON"));
    }

    #[test]
    fn non_finite_numeric_field_rejected_then_recovered_downstream() {
        // Strategy 1 validation rejects the NaN tp_price; strategy 4 then
        // recovers signal/confidence without the bad field.
        let input = r#"{"signal":"BUY","confidence":70,"reason":"r","tp_price":"abc"}"#;
        let parsed = parse_signal_text(input).unwrap();
        assert_eq!(parsed.strategy, 4);
        assert_eq!(parsed.tp_price, None);
    }

    #[test]
    fn confidence_string_and_percent_tolerated() {
        let input = r#"{"signal":"SELL","confidence":"88%","reason":"overbought"}"#;
        let parsed = parse_signal_text(input).unwrap();
        assert_eq!(parsed.confidence, 88);
    }

    #[test]
    fn cascade_ordering_strict() {
        // A clean-JSON input must come out of strategy 1, never a later one.
        let clean = r#"{"signal":"HOLD","confidence":10,"reason":"r"}"#;
        assert_eq!(parse_signal_text(clean).unwrap().strategy, 1);

        // A fenced input whose body is clean must come out of strategy 2.
        let fenced = format!("prose\n```json\n{clean}\n```\nprose");
        assert_eq!(parse_signal_text(&fenced).unwrap().strategy, 2);
    }

    #[test]
    fn gate_stats_fallback_rate() {
        let stats = GateStats::default();
        stats.record_success(1);
        stats.record_success(1);
        stats.record_success(4);
        stats.record_success(5);
        stats.record_reject();
        let snap = stats.snapshot();
        assert_eq!(snap.by_strategy[0], 2);
        assert_eq!(snap.rejects, 1);
        assert!((snap.fallback_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn balanced_object_is_string_aware() {
        let input = r#"{"signal":"BUY","confidence":50,"reason":"brace } inside string"}"#;
        let obj = largest_balanced_object(input).unwrap();
        assert_eq!(obj, input);
    }
}
