//! Portfolio snapshot builder and the immutable per-cycle input bundle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::RawPosition;
use crate::error::{EngineError, EngineResult};
use crate::models::{AssetStatistics, PortfolioState, Position};

use super::forecast::{normalize_ticker, ForecastBatch};

/// Everything the engine reads during one pass, gathered up front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSnapshot {
    pub portfolio: PortfolioState,
    pub forecasts: ForecastBatch,
    pub statistics: BTreeMap<String, AssetStatistics>,
}

impl CycleSnapshot {
    pub fn as_of(&self) -> DateTime<Utc> {
        self.portfolio.as_of
    }
}

/// Merges balance and position data into a `PortfolioState`.
pub struct SnapshotBuilder;

impl SnapshotBuilder {
    /// Build the portfolio state for this cycle.
    ///
    /// Zero-sized positions are dust and ignored. Negative amounts or two
    /// positions for the same ticker make the snapshot unusable.
    pub fn build_portfolio(
        cash_available: Decimal,
        raw_positions: &[RawPosition],
        equity_peak: Option<Decimal>,
        as_of: DateTime<Utc>,
    ) -> EngineResult<PortfolioState> {
        if cash_available < Decimal::ZERO {
            return Err(EngineError::InvalidSnapshot(format!(
                "negative cash balance {}",
                cash_available
            )));
        }

        let mut positions = BTreeMap::new();
        for raw in raw_positions {
            let ticker = normalize_ticker(&raw.ticker);
            if ticker.is_empty() {
                return Err(EngineError::InvalidSnapshot("position with empty ticker".into()));
            }
            if raw.amount_invested < Decimal::ZERO {
                return Err(EngineError::InvalidSnapshot(format!(
                    "{}: negative invested amount {}",
                    ticker, raw.amount_invested
                )));
            }
            if raw.entry_price < Decimal::ZERO {
                return Err(EngineError::InvalidSnapshot(format!(
                    "{}: negative entry price {}",
                    ticker, raw.entry_price
                )));
            }
            if raw.amount_invested.is_zero() {
                debug!(ticker = %ticker, "Ignoring zero-sized position");
                continue;
            }

            let mut position = Position::new(
                ticker.clone(),
                raw.amount_invested,
                raw.entry_price,
                raw.entry_timestamp,
            );
            if let Some(mark) = raw.current_price.filter(|p| *p > Decimal::ZERO) {
                position = position.with_mark(mark);
            }

            if positions.insert(ticker.clone(), position).is_some() {
                return Err(EngineError::InvalidSnapshot(format!(
                    "more than one open position for {}",
                    ticker
                )));
            }
        }

        let mut state = PortfolioState::new(cash_available, positions, as_of);
        if let Some(peak) = equity_peak {
            state = state.with_equity_peak(peak);
        }

        debug!(
            cash = %state.cash_available,
            invested = %state.invested_value(),
            total = %state.total_value,
            drawdown = %state.drawdown,
            positions = state.position_count(),
            "Portfolio snapshot built"
        );

        Ok(state)
    }

    /// Key statistics by normalized ticker. Conflicting duplicates are dropped.
    pub fn index_statistics(stats: Vec<AssetStatistics>) -> BTreeMap<String, AssetStatistics> {
        let mut indexed: BTreeMap<String, AssetStatistics> = BTreeMap::new();
        let mut conflicting = Vec::new();

        for mut s in stats {
            s.ticker = normalize_ticker(&s.ticker);
            if let Some(existing) = indexed.get(&s.ticker) {
                if *existing != s {
                    conflicting.push(s.ticker.clone());
                }
                continue;
            }
            indexed.insert(s.ticker.clone(), s);
        }

        for ticker in conflicting {
            if indexed.remove(&ticker).is_some() {
                warn!(ticker = %ticker, "Conflicting asset statistics, excluding ticker");
            }
        }

        indexed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn raw(ticker: &str, amount: Decimal) -> RawPosition {
        RawPosition {
            ticker: ticker.to_string(),
            amount_invested: amount,
            entry_price: dec!(100),
            entry_timestamp: Utc::now(),
            current_price: None,
        }
    }

    #[test]
    fn test_build_portfolio() {
        let state = SnapshotBuilder::build_portfolio(
            dec!(1000),
            &[raw("btc-usd", dec!(400)), raw("ETH-USD", dec!(600)), raw("SOL-USD", dec!(0))],
            None,
            Utc::now(),
        )
        .unwrap();

        assert_eq!(state.total_value, dec!(2000));
        assert_eq!(state.position_count(), 2);
        assert!(state.has_position("BTC-USD"));
        assert!(!state.has_position("SOL-USD"));
    }

    #[test]
    fn test_duplicate_positions_are_fatal() {
        let err = SnapshotBuilder::build_portfolio(
            dec!(1000),
            &[raw("BTC-USD", dec!(400)), raw("btc-usd", dec!(100))],
            None,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSnapshot(_)));
    }

    #[test]
    fn test_negative_values_are_fatal() {
        assert!(SnapshotBuilder::build_portfolio(dec!(-1), &[], None, Utc::now()).is_err());
        assert!(
            SnapshotBuilder::build_portfolio(dec!(10), &[raw("BTC-USD", dec!(-5))], None, Utc::now())
                .is_err()
        );
    }

    #[test]
    fn test_equity_peak_sets_drawdown() {
        let state = SnapshotBuilder::build_portfolio(
            dec!(8000),
            &[raw("BTC-USD", dec!(1000))],
            Some(dec!(10000)),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(state.drawdown, dec!(0.1));
    }

    #[test]
    fn test_index_statistics_drops_conflicts() {
        let stat = |ticker: &str, win: f64| AssetStatistics {
            ticker: ticker.to_string(),
            historical_win_rate: win,
            avg_win: 0.08,
            avg_loss: 0.04,
            annualized_volatility: 0.25,
        };

        let indexed = SnapshotBuilder::index_statistics(vec![
            stat("btc-usd", 0.6),
            stat("BTC-USD", 0.6),
            stat("ETH-USD", 0.55),
            stat("eth-usd", 0.7),
        ]);

        assert!(indexed.contains_key("BTC-USD"));
        assert!(!indexed.contains_key("ETH-USD"));
    }
}
