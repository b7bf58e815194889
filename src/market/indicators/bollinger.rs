// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = SMA(period); upper/lower = middle ± k * population stddev.
// Bandwidth = (upper - lower) / middle * 100 — the volatility input to the
// regime classifier.
// =============================================================================

use super::ma::sma;

/// Latest Bollinger band values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bollinger {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// Band width as a percentage of the middle band.
    pub bandwidth_pct: f64,
}

/// Compute the latest bands over `closes` (typically period 20, k = 2.0).
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> Option<Bollinger> {
    if period < 2 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = sma(closes, period)?;

    let variance = window.iter().map(|c| (c - middle).powi(2)).sum::<f64>() / period as f64;
    let stddev = variance.sqrt();
    if !stddev.is_finite() {
        return None;
    }

    let upper = middle + k * stddev;
    let lower = middle - k * stddev;
    let bandwidth_pct = if middle != 0.0 {
        (upper - lower) / middle * 100.0
    } else {
        return None;
    };

    Some(Bollinger { upper, middle, lower, bandwidth_pct })
}

/// Standard 20-period, 2-sigma bands.
pub fn bollinger_standard(closes: &[f64]) -> Option<Bollinger> {
    bollinger(closes, 20, 2.0)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data() {
        assert!(bollinger(&[1.0; 10], 20, 2.0).is_none());
        assert!(bollinger(&[1.0; 30], 1, 2.0).is_none());
    }

    #[test]
    fn flat_market_collapses_bands() {
        let b = bollinger_standard(&[100.0; 40]).unwrap();
        assert!((b.upper - 100.0).abs() < 1e-10);
        assert!((b.lower - 100.0).abs() < 1e-10);
        assert!(b.bandwidth_pct.abs() < 1e-10);
    }

    #[test]
    fn bands_bracket_the_mean() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + (i as f64).sin() * 3.0).collect();
        let b = bollinger_standard(&closes).unwrap();
        assert!(b.upper > b.middle);
        assert!(b.middle > b.lower);
        assert!(b.bandwidth_pct > 0.0);
    }

    #[test]
    fn wider_swings_widen_bandwidth() {
        let calm: Vec<f64> = (0..40).map(|i| 100.0 + (i as f64).sin() * 0.5).collect();
        let wild: Vec<f64> = (0..40).map(|i| 100.0 + (i as f64).sin() * 8.0).collect();
        let calm_bw = bollinger_standard(&calm).unwrap().bandwidth_pct;
        let wild_bw = bollinger_standard(&wild).unwrap().bandwidth_pct;
        assert!(wild_bw > calm_bw);
    }
}
