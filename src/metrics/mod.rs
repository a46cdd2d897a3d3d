//! Analytics helpers for asset statistics and equity drawdown.

mod calculator;

pub use calculator::{max_drawdown, StatisticsCalculator};
