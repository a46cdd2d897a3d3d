//! Calculator for asset statistics: win rate, average win/loss, volatility, drawdown.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use statrs::statistics::Statistics;
use tracing::warn;

use crate::models::AssetStatistics;

/// Periods per year for daily crypto returns (markets never close).
pub const ANNUALIZATION_DAYS: f64 = 365.0;

/// Calculator for per-asset statistics consumed by the sizing model.
pub struct StatisticsCalculator;

impl StatisticsCalculator {
    /// Derive statistics from a series of periodic returns (0.02 = +2%).
    ///
    /// Returns `None` with fewer than two finite observations. Flat periods
    /// count as neither wins nor losses.
    pub fn from_returns(ticker: &str, returns: &[f64]) -> Option<AssetStatistics> {
        let returns: Vec<f64> = returns.iter().copied().filter(|r| r.is_finite()).collect();
        if returns.len() < 2 {
            return None;
        }

        let wins: Vec<f64> = returns.iter().copied().filter(|r| *r > 0.0).collect();
        let losses: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).map(f64::abs).collect();

        let decided = wins.len() + losses.len();
        let historical_win_rate = if decided > 0 {
            wins.len() as f64 / decided as f64
        } else {
            0.0
        };

        let avg_win = if wins.is_empty() { 0.0 } else { wins.mean() };
        let avg_loss = if losses.is_empty() { 0.0 } else { losses.mean() };

        // Annualized assuming daily returns and 365 trading days
        let annualized_volatility = returns.std_dev() * ANNUALIZATION_DAYS.sqrt();

        Some(AssetStatistics {
            ticker: ticker.to_string(),
            historical_win_rate,
            avg_win,
            avg_loss,
            annualized_volatility,
        })
    }

    /// Statistics for every ticker with enough data, in ticker order.
    pub fn from_series(series: &BTreeMap<String, Vec<f64>>) -> Vec<AssetStatistics> {
        series
            .iter()
            .filter_map(|(ticker, returns)| {
                let stats = Self::from_returns(ticker, returns);
                if stats.is_none() {
                    warn!(ticker = %ticker, observations = returns.len(), "Not enough returns for statistics");
                }
                stats
            })
            .collect()
    }

    /// Simple returns from a price series.
    pub fn returns_from_prices(prices: &[f64]) -> Vec<f64> {
        prices
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect()
    }
}

/// Maximum peak-to-trough decline of an equity series, as a fraction.
pub fn max_drawdown(values: &[Decimal]) -> Decimal {
    let mut peak = Decimal::ZERO;
    let mut max_dd = Decimal::ZERO;

    for value in values {
        if *value > peak {
            peak = *value;
        }
        if peak > Decimal::ZERO {
            let dd = (peak - value) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }

    max_dd.round_dp(6)
}
