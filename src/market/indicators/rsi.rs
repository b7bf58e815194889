// =============================================================================
// Relative Strength Index (RSI) — Wilder's smoothing
// =============================================================================
//
// Seeded with the SMA of the first `period` gains/losses, then smoothed:
//   avg = (prev_avg * (period - 1) + current) / period
//   RSI = 100 - 100 / (1 + avg_gain / avg_loss)
// =============================================================================

/// Latest RSI value over `closes`, or `None` with insufficient data.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let period_f = period as f64;

    let mut avg_gain = deltas[..period].iter().filter(|d| **d > 0.0).sum::<f64>() / period_f;
    let mut avg_loss =
        deltas[..period].iter().filter(|d| **d < 0.0).map(|d| -d).sum::<f64>() / period_f;

    for &d in &deltas[period..] {
        let gain = d.max(0.0);
        let loss = (-d).max(0.0);
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    let value = if avg_gain == 0.0 && avg_loss == 0.0 {
        // No movement at all — neutral.
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    };

    value.is_finite().then_some(value)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data() {
        assert!(rsi(&[], 14).is_none());
        assert!(rsi(&[1.0; 14], 14).is_none());
        assert!(rsi(&[1.0, 2.0], 0).is_none());
    }

    #[test]
    fn all_gains_is_100() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let v = rsi(&closes, 14).unwrap();
        assert!((v - 100.0).abs() < 1e-10);
    }

    #[test]
    fn all_losses_is_0() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        let v = rsi(&closes, 14).unwrap();
        assert!(v.abs() < 1e-10);
    }

    #[test]
    fn flat_market_is_neutral() {
        let v = rsi(&[100.0; 30], 14).unwrap();
        assert!((v - 50.0).abs() < 1e-10);
    }

    #[test]
    fn stays_in_range() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08,
            45.89, 46.03, 44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        let v = rsi(&closes, 14).unwrap();
        assert!((0.0..=100.0).contains(&v));
    }
}
