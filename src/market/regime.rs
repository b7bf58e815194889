// =============================================================================
// Market Regime Classifier — the single source of regime truth
// =============================================================================
//
// Exactly one function produces the regime label carried by every snapshot,
// signal and prompt; no caller recomputes or re-derives it.
//
// Detection hierarchy (evaluated top-to-bottom; first match wins):
//
//   1. VOLATILE  — Bollinger bandwidth >= 6.0 %
//   2. SQUEEZE   — Bollinger bandwidth <= 1.8 %
//   3. TREND-UP  — window slope >= +0.35 % with bullish EMA alignment
//   4. TREND-DOWN— window slope <= -0.35 % with bearish EMA alignment
//   5. SIDEWAYS  — anything else
// =============================================================================

use serde::{Deserialize, Serialize};

use super::indicators::bollinger::bollinger_standard;
use super::indicators::ma::ema_alignment;

/// Bandwidth at or above which the market counts as volatile (percent).
const VOLATILE_BANDWIDTH_PCT: f64 = 6.0;
/// Bandwidth at or below which the market counts as squeezed (percent).
const SQUEEZE_BANDWIDTH_PCT: f64 = 1.8;
/// Minimum absolute slope over the slope window to call a trend (percent).
const TREND_SLOPE_PCT: f64 = 0.35;
/// Number of trailing closes the slope is measured over.
const SLOPE_WINDOW: usize = 20;

/// Market regime label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    #[serde(rename = "trend-up")]
    TrendUp,
    #[serde(rename = "trend-down")]
    TrendDown,
    #[serde(rename = "sideways")]
    Sideways,
    #[serde(rename = "volatile")]
    Volatile,
    #[serde(rename = "squeeze")]
    Squeeze,
}

impl Regime {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TrendUp => "trend-up",
            Self::TrendDown => "trend-down",
            Self::Sideways => "sideways",
            Self::Volatile => "volatile",
            Self::Squeeze => "squeeze",
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classify the market from a close-price window (newest last).
///
/// Falls back to `Sideways` when there is not enough history for the
/// volatility or trend inputs.
pub fn classify(closes: &[f64]) -> Regime {
    let Some(bands) = bollinger_standard(closes) else {
        return Regime::Sideways;
    };

    if bands.bandwidth_pct >= VOLATILE_BANDWIDTH_PCT {
        return Regime::Volatile;
    }
    if bands.bandwidth_pct <= SQUEEZE_BANDWIDTH_PCT {
        return Regime::Squeeze;
    }

    let slope = slope_pct(closes, SLOPE_WINDOW);
    let alignment = ema_alignment(closes);

    match (slope, alignment) {
        (Some(s), Some(true)) if s >= TREND_SLOPE_PCT => Regime::TrendUp,
        (Some(s), Some(false)) if s <= -TREND_SLOPE_PCT => Regime::TrendDown,
        _ => Regime::Sideways,
    }
}

/// Percent change across the last `window` closes.
fn slope_pct(closes: &[f64], window: usize) -> Option<f64> {
    if closes.len() < window || window < 2 {
        return None;
    }
    let tail = &closes[closes.len() - window..];
    let first = tail[0];
    let last = tail[window - 1];
    if first <= 0.0 {
        return None;
    }
    let pct = (last - first) / first * 100.0;
    pct.is_finite().then_some(pct)
}

// =============================================================================
// Tests — these pin the authoritative constants
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// A smooth trend with per-bar drift `drift_pct` and tiny noise.
    fn trending(n: usize, start: f64, drift_pct: f64) -> Vec<f64> {
        let mut v = Vec::with_capacity(n);
        let mut price = start;
        for i in 0..n {
            price *= 1.0 + drift_pct / 100.0;
            // Small deterministic wiggle so the bands do not collapse.
            v.push(price * (1.0 + 0.0005 * ((i % 3) as f64 - 1.0)));
        }
        v
    }

    #[test]
    fn uptrend_classifies_trend_up() {
        let closes = trending(120, 100.0, 0.10);
        assert_eq!(classify(&closes), Regime::TrendUp);
    }

    #[test]
    fn downtrend_classifies_trend_down() {
        let closes = trending(120, 100.0, -0.10);
        assert_eq!(classify(&closes), Regime::TrendDown);
    }

    #[test]
    fn flat_noise_classifies_squeeze_or_sideways() {
        // Tiny oscillation: bandwidth well under the squeeze ceiling.
        let closes: Vec<f64> = (0..120)
            .map(|i| 100.0 + (i as f64 * 0.9).sin() * 0.2)
            .collect();
        assert_eq!(classify(&closes), Regime::Squeeze);
    }

    #[test]
    fn wild_swings_classify_volatile() {
        let closes: Vec<f64> = (0..120)
            .map(|i| 100.0 + (i as f64 * 0.8).sin() * 10.0)
            .collect();
        assert_eq!(classify(&closes), Regime::Volatile);
    }

    #[test]
    fn moderate_chop_classifies_sideways() {
        // Oscillation big enough to escape the squeeze band, small enough to
        // stay under the volatile floor, with no persistent slope.
        let closes: Vec<f64> = (0..120)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 1.2)
            .collect();
        assert_eq!(classify(&closes), Regime::Sideways);
    }

    #[test]
    fn short_history_defaults_sideways() {
        assert_eq!(classify(&[100.0; 5]), Regime::Sideways);
        assert_eq!(classify(&[]), Regime::Sideways);
    }

    #[test]
    fn labels_serialize_to_spec_strings() {
        assert_eq!(serde_json::to_string(&Regime::TrendUp).unwrap(), r#""trend-up""#);
        assert_eq!(serde_json::to_string(&Regime::Squeeze).unwrap(), r#""squeeze""#);
        assert_eq!(Regime::Volatile.to_string(), "volatile");
    }
}
