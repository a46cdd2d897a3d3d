//! Historical statistics per asset, used for Kelly and volatility sizing.

use serde::{Deserialize, Serialize};

/// Read-only performance statistics for one ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetStatistics {
    pub ticker: String,

    /// Fraction of historical trades that closed in profit (0.0 to 1.0)
    pub historical_win_rate: f64,

    /// Average return of winning trades (e.g. 0.08 = 8%)
    pub avg_win: f64,

    /// Average return of losing trades, sign ignored (e.g. 0.04 = 4%)
    pub avg_loss: f64,

    /// Annualized volatility of returns (e.g. 0.25 = 25%)
    pub annualized_volatility: f64,
}

impl AssetStatistics {
    /// Payoff ratio `avg_win / |avg_loss|`, if defined.
    pub fn payoff_ratio(&self) -> Option<f64> {
        let loss = self.avg_loss.abs();
        if self.avg_loss <= 0.0 || !loss.is_finite() {
            return None;
        }
        Some(self.avg_win / loss)
    }
}
