//! Open position held by the portfolio.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single open position. At most one exists per ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticker: String,

    /// Capital committed to the position in the quote currency
    pub amount_invested: Decimal,

    /// Average entry price per unit
    pub entry_price: Decimal,

    /// When the position was opened
    pub entry_timestamp: DateTime<Utc>,

    /// Latest mark price, when the exchange reports one
    #[serde(default)]
    pub current_price: Option<Decimal>,
}

impl Position {
    pub fn new(
        ticker: impl Into<String>,
        amount_invested: Decimal,
        entry_price: Decimal,
        entry_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            ticker: ticker.into(),
            amount_invested,
            entry_price,
            entry_timestamp,
            current_price: None,
        }
    }

    /// Attach a mark price.
    pub fn with_mark(mut self, current_price: Decimal) -> Self {
        self.current_price = Some(current_price);
        self
    }

    /// Return since entry, or `None` without a mark or a usable entry price.
    pub fn return_pct(&self) -> Option<Decimal> {
        let current = self.current_price?;
        if self.entry_price <= Decimal::ZERO {
            return None;
        }
        Some((current - self.entry_price) / self.entry_price)
    }

    /// Value at the mark price, falling back to the invested amount.
    pub fn marked_value(&self) -> Decimal {
        match self.return_pct() {
            Some(ret) => self.amount_invested * (Decimal::ONE + ret),
            None => self.amount_invested,
        }
    }
}
