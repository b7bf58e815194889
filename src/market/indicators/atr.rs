// =============================================================================
// Average True Range (ATR) — Wilder's smoothing
// =============================================================================
//
// True range of bar t:
//   TR_t = max(high - low, |high - prev_close|, |low - prev_close|)
// ATR seeds with the SMA of the first `period` TRs and then applies
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

/// Latest ATR over aligned `highs` / `lows` / `closes` slices.
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
    let n = closes.len();
    if period == 0 || n < period + 1 || highs.len() != n || lows.len() != n {
        return None;
    }

    let true_ranges: Vec<f64> = (1..n)
        .map(|i| {
            let hl = highs[i] - lows[i];
            let hc = (highs[i] - closes[i - 1]).abs();
            let lc = (lows[i] - closes[i - 1]).abs();
            hl.max(hc).max(lc)
        })
        .collect();

    let period_f = period as f64;
    let mut value = true_ranges[..period].iter().sum::<f64>() / period_f;

    for &tr in &true_ranges[period..] {
        value = (value * (period_f - 1.0) + tr) / period_f;
    }

    (value.is_finite() && value >= 0.0).then_some(value)
}

/// ATR as a percentage of the latest close — what the snapshot carries.
pub fn atr_pct(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
    let last_close = *closes.last()?;
    if last_close <= 0.0 {
        return None;
    }
    atr(highs, lows, closes, period).map(|a| a / last_close * 100.0)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn flat(n: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        (vec![100.0; n], vec![100.0; n], vec![100.0; n])
    }

    #[test]
    fn insufficient_or_misaligned_data() {
        let (h, l, c) = flat(10);
        assert!(atr(&h, &l, &c, 14).is_none());
        assert!(atr(&h[..5], &l, &c, 3).is_none());
        assert!(atr(&h, &l, &c, 0).is_none());
    }

    #[test]
    fn flat_market_has_zero_atr() {
        let (h, l, c) = flat(30);
        let v = atr(&h, &l, &c, 14).unwrap();
        assert!(v.abs() < 1e-12);
    }

    #[test]
    fn constant_range_equals_atr() {
        // Every bar spans exactly 2.0 with unchanged closes: TR = 2.0.
        let n = 40;
        let highs = vec![101.0; n];
        let lows = vec![99.0; n];
        let closes = vec![100.0; n];
        let v = atr(&highs, &lows, &closes, 14).unwrap();
        assert!((v - 2.0).abs() < 1e-9);
    }

    #[test]
    fn gap_widens_true_range() {
        // A close far below the next bar's low makes |high - prev_close|
        // dominate the plain high-low span.
        let highs = vec![10.0, 20.0, 20.0, 20.0, 20.0];
        let lows = vec![9.0, 19.0, 19.0, 19.0, 19.0];
        let closes = vec![9.5, 19.5, 19.5, 19.5, 19.5];
        let v = atr(&highs, &lows, &closes, 3).unwrap();
        assert!(v > 1.0);
    }

    #[test]
    fn atr_pct_normalises_by_close() {
        let n = 40;
        let highs = vec![101.0; n];
        let lows = vec![99.0; n];
        let closes = vec![100.0; n];
        let pct = atr_pct(&highs, &lows, &closes, 14).unwrap();
        assert!((pct - 2.0).abs() < 1e-9);
    }
}
