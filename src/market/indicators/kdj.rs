// =============================================================================
// KDJ Stochastic Oscillator
// =============================================================================
//
// RSV_t = (close - lowest_low(n)) / (highest_high(n) - lowest_low(n)) * 100
// K and D are smoothed with the conventional 2/3 carry:
//   K_t = 2/3 * K_{t-1} + 1/3 * RSV_t      (K_0 = 50)
//   D_t = 2/3 * D_{t-1} + 1/3 * K_t        (D_0 = 50)
//   J_t = 3 * K_t - 2 * D_t
//
// J overshoots beyond [0, 100] by design; callers treat J > 100 / J < 0 as
// exhaustion markers.
// =============================================================================

/// Latest KDJ triple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kdj {
    pub k: f64,
    pub d: f64,
    pub j: f64,
}

/// Compute the latest KDJ over aligned OHLC slices (typically n = 9).
pub fn kdj(highs: &[f64], lows: &[f64], closes: &[f64], n: usize) -> Option<Kdj> {
    let len = closes.len();
    if n == 0 || len < n || highs.len() != len || lows.len() != len {
        return None;
    }

    let mut k = 50.0;
    let mut d = 50.0;

    for i in (n - 1)..len {
        let window_high = highs[i + 1 - n..=i].iter().cloned().fold(f64::MIN, f64::max);
        let window_low = lows[i + 1 - n..=i].iter().cloned().fold(f64::MAX, f64::min);
        let range = window_high - window_low;

        let rsv = if range > 0.0 {
            (closes[i] - window_low) / range * 100.0
        } else {
            50.0 // Flat window — neutral.
        };

        k = k * 2.0 / 3.0 + rsv / 3.0;
        d = d * 2.0 / 3.0 + k / 3.0;
    }

    let j = 3.0 * k - 2.0 * d;
    (k.is_finite() && d.is_finite() && j.is_finite()).then_some(Kdj { k, d, j })
}

/// Standard 9-period KDJ.
pub fn kdj_standard(highs: &[f64], lows: &[f64], closes: &[f64]) -> Option<Kdj> {
    kdj(highs, lows, closes, 9)
}
