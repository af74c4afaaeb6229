// Technical indicators used by the built-in trend analyzer

pub mod atr;
pub mod moving_average;

pub use atr::{calculate_atr, true_ranges};
pub use moving_average::{calculate_ema, calculate_sma, closes};
