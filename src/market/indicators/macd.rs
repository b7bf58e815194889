// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// Standard 12/26/9 construction:
//   macd_line = EMA(close, fast) - EMA(close, slow)
//   signal    = EMA(macd_line, signal_period)
//   histogram = macd_line - signal
// =============================================================================

use super::ma::ema_series;

/// Latest MACD values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the latest MACD for `closes` with the given periods.
///
/// Returns `None` when there is not enough data for the slow EMA plus the
/// signal EMA of the MACD line.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> Option<Macd> {
    if fast == 0 || slow <= fast || signal_period == 0 {
        return None;
    }

    let fast_series = ema_series(closes, fast);
    let slow_series = ema_series(closes, slow);
    if slow_series.is_empty() {
        return None;
    }

    // Align both series on their tails: the slow series starts later.
    let offset = fast_series.len().checked_sub(slow_series.len())?;
    let macd_line: Vec<f64> = slow_series
        .iter()
        .zip(&fast_series[offset..])
        .map(|(s, f)| f - s)
        .collect();

    let signal_series = ema_series(&macd_line, signal_period);
    let signal = *signal_series.last()?;
    let macd = *macd_line.last()?;
    let histogram = macd - signal;

    (macd.is_finite() && signal.is_finite()).then_some(Macd { macd, signal, histogram })
}

/// Standard 12/26/9 MACD.
pub fn macd_standard(closes: &[f64]) -> Option<Macd> {
    macd(closes, 12, 26, 9)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data() {
        assert!(macd_standard(&[1.0; 10]).is_none());
        assert!(macd(&[1.0; 100], 0, 26, 9).is_none());
        assert!(macd(&[1.0; 100], 26, 12, 9).is_none());
    }

    #[test]
    fn flat_market_is_zero() {
        let m = macd_standard(&[100.0; 120]).unwrap();
        assert!(m.macd.abs() < 1e-9);
        assert!(m.signal.abs() < 1e-9);
        assert!(m.histogram.abs() < 1e-9);
    }

    #[test]
    fn uptrend_has_positive_macd() {
        let closes: Vec<f64> = (1..=200).map(|i| 100.0 + i as f64).collect();
        let m = macd_standard(&closes).unwrap();
        assert!(m.macd > 0.0);
        assert!(m.signal > 0.0);
    }

    #[test]
    fn downtrend_has_negative_macd() {
        let closes: Vec<f64> = (1..=200).map(|i| 500.0 - i as f64).collect();
        let m = macd_standard(&closes).unwrap();
        assert!(m.macd < 0.0);
    }

    #[test]
    fn histogram_is_macd_minus_signal() {
        let closes: Vec<f64> = (1..=200)
            .map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.1)
            .collect();
        let m = macd_standard(&closes).unwrap();
        assert!((m.histogram - (m.macd - m.signal)).abs() < 1e-12);
    }
}
