// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators that feed the
// debate snapshot. Every public function returns `Option<T>` or an empty
// series so callers are forced to handle insufficient-data and numerical
// edge cases.

pub mod atr;
pub mod bollinger;
pub mod kdj;
pub mod ma;
pub mod macd;
pub mod rsi;
