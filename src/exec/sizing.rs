// =============================================================================
// Position Sizing — four-way cap, venue step and min-notional clamping
// =============================================================================
//
//   budget = min(amount_usdt, max_position_usdt,
//                amount_pct% * equity, max_position_pct% * equity)
//   qty    = budget / mark_price, floored to the venue step size
//
// A quantity whose notional falls under the venue minimum is a sizing
// failure, not an order.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::runtime_config::TradeParams;

/// Venue lot constraints for one symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolFilters {
    /// Quantity step size (e.g. 0.001 BTC).
    pub step_size: f64,
    /// Minimum order notional in quote currency (e.g. 5 USDT).
    pub min_notional: f64,
}

impl Default for SymbolFilters {
    fn default() -> Self {
        Self { step_size: 0.001, min_notional: 5.0 }
    }
}

/// Why sizing produced no order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SizingError {
    #[error("below-min-notional")]
    BelowMinNotional,
    #[error("invalid sizing input: {0}")]
    InvalidInput(&'static str),
}

/// Compute the order quantity for one open intent.
pub fn position_qty(
    params: &TradeParams,
    equity: f64,
    mark_price: f64,
    filters: &SymbolFilters,
) -> Result<f64, SizingError> {
    if mark_price <= 0.0 || !mark_price.is_finite() {
        return Err(SizingError::InvalidInput("mark_price"));
    }
    if equity < 0.0 || !equity.is_finite() {
        return Err(SizingError::InvalidInput("equity"));
    }
    if filters.step_size <= 0.0 {
        return Err(SizingError::InvalidInput("step_size"));
    }

    let budget = params
        .amount_usdt
        .min(params.max_position_usdt)
        .min(params.amount_pct / 100.0 * equity)
        .min(params.max_position_pct / 100.0 * equity);

    if budget <= 0.0 {
        return Err(SizingError::BelowMinNotional);
    }

    let raw_qty = budget / mark_price;
    let qty = floor_to_step(raw_qty, filters.step_size);

    if qty <= 0.0 || qty * mark_price < filters.min_notional {
        return Err(SizingError::BelowMinNotional);
    }

    Ok(qty)
}

/// Floor `qty` to an integer multiple of `step`.
pub fn floor_to_step(qty: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return qty;
    }
    (qty / step).floor() * step
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TradeParams {
        TradeParams {
            amount_usdt: 200.0,
            max_position_usdt: 1000.0,
            amount_pct: 3.0,
            max_position_pct: 20.0,
            ..TradeParams::default()
        }
    }

    #[test]
    fn pct_cap_binds_for_small_equity() {
        // 3% of 1000 = 30 USDT beats the flat 200 USDT budget.
        let qty = position_qty(&params(), 1000.0, 100.0, &SymbolFilters::default()).unwrap();
        assert!((qty - 0.3).abs() < 1e-9);
    }

    #[test]
    fn flat_cap_binds_for_large_equity() {
        // 3% of 100_000 = 3000; flat 200 USDT wins.
        let qty = position_qty(&params(), 100_000.0, 100.0, &SymbolFilters::default()).unwrap();
        assert!((qty - 2.0).abs() < 1e-9);
    }

    #[test]
    fn qty_floors_to_step() {
        let filters = SymbolFilters { step_size: 0.1, min_notional: 5.0 };
        // 30 / 7 = 4.2857... -> 4.2
        let qty = position_qty(&params(), 1000.0, 7.0, &filters).unwrap();
        assert!((qty - 4.2).abs() < 1e-9);
    }

    #[test]
    fn below_min_notional_rejected() {
        let filters = SymbolFilters { step_size: 0.001, min_notional: 5.0 };
        // Equity 10 -> budget = 0.3 USDT < 5 USDT min notional.
        let err = position_qty(&params(), 10.0, 100.0, &filters).unwrap_err();
        assert_eq!(err, SizingError::BelowMinNotional);
    }

    #[test]
    fn zero_equity_rejected() {
        let err = position_qty(&params(), 0.0, 100.0, &SymbolFilters::default()).unwrap_err();
        assert_eq!(err, SizingError::BelowMinNotional);
    }

    #[test]
    fn bad_mark_price_rejected() {
        assert_eq!(
            position_qty(&params(), 1000.0, 0.0, &SymbolFilters::default()).unwrap_err(),
            SizingError::InvalidInput("mark_price")
        );
        assert_eq!(
            position_qty(&params(), 1000.0, f64::NAN, &SymbolFilters::default()).unwrap_err(),
            SizingError::InvalidInput("mark_price")
        );
    }

    #[test]
    fn coarse_step_can_push_below_notional() {
        // Budget buys 0.6 of step 1.0 -> floors to 0 -> below min notional.
        let filters = SymbolFilters { step_size: 1.0, min_notional: 5.0 };
        let err = position_qty(&params(), 1000.0, 50.0, &filters).unwrap_err();
        assert_eq!(err, SizingError::BelowMinNotional);
    }
}
