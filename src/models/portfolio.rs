//! Portfolio snapshot passed explicitly through every engine call.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Position;

/// Immutable view of the portfolio for one decision cycle.
///
/// Rebuilt from the exchange every cycle; never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    /// Free quote-currency balance
    pub cash_available: Decimal,

    /// Open positions keyed by ticker
    pub positions: BTreeMap<String, Position>,

    /// `cash_available + Σ amount_invested`
    pub total_value: Decimal,

    /// Highest marked portfolio value seen, including this snapshot
    pub peak_value: Decimal,

    /// Running peak-to-trough decline (0.0 to 1.0)
    pub drawdown: Decimal,

    /// When the snapshot was taken
    pub as_of: DateTime<Utc>,
}

impl PortfolioState {
    /// Build a state with no drawdown history.
    pub fn new(
        cash_available: Decimal,
        positions: BTreeMap<String, Position>,
        as_of: DateTime<Utc>,
    ) -> Self {
        let invested: Decimal = positions.values().map(|p| p.amount_invested).sum();
        let total_value = cash_available + invested;
        let mut state = Self {
            cash_available,
            positions,
            total_value,
            peak_value: total_value,
            drawdown: Decimal::ZERO,
            as_of,
        };
        state.peak_value = state.marked_value();
        state
    }

    /// Apply a historical equity peak and derive the drawdown.
    pub fn with_equity_peak(mut self, historical_peak: Decimal) -> Self {
        let marked = self.marked_value();
        self.peak_value = historical_peak.max(marked);
        self.drawdown = if self.peak_value > Decimal::ZERO {
            ((self.peak_value - marked) / self.peak_value).round_dp(6)
        } else {
            Decimal::ZERO
        };
        self
    }

    /// Capital currently committed to open positions.
    pub fn invested_value(&self) -> Decimal {
        self.positions.values().map(|p| p.amount_invested).sum()
    }

    /// Cash plus positions at their mark price (cost basis when unmarked).
    pub fn marked_value(&self) -> Decimal {
        self.cash_available
            + self
                .positions
                .values()
                .map(Position::marked_value)
                .sum::<Decimal>()
    }

    /// Fraction of total value held in positions.
    pub fn exposure(&self) -> Decimal {
        if self.total_value.is_zero() {
            return Decimal::ZERO;
        }
        self.invested_value() / self.total_value
    }

    pub fn has_position(&self, ticker: &str) -> bool {
        self.positions.contains_key(ticker)
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn held_tickers(&self) -> impl Iterator<Item = &str> {
        self.positions.keys().map(String::as_str)
    }
}
