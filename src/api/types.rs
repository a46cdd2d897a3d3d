//! Wire types returned by the forecast, portfolio and statistics collaborators.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Raw classifier output for one ticker, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPrediction {
    /// "BUY" / "SELL" (or 1 / 0); derived from the probabilities when absent
    #[serde(default, alias = "prediction")]
    pub predicted_side: Option<String>,

    /// Meta-model confidence
    pub confidence: f64,

    #[serde(default, alias = "buy_confidence")]
    pub buy_probability: Option<f64>,

    #[serde(default, alias = "sell_confidence")]
    pub sell_probability: Option<f64>,
}

/// Response of the forecast endpoint: ticker → raw prediction.
pub type PredictionsResponse = BTreeMap<String, RawPrediction>;

/// Open position as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPosition {
    #[serde(alias = "symbol")]
    pub ticker: String,

    #[serde(alias = "amount_usdc")]
    pub amount_invested: Decimal,

    pub entry_price: Decimal,

    #[serde(alias = "entry_date")]
    pub entry_timestamp: DateTime<Utc>,

    #[serde(default)]
    pub current_price: Option<Decimal>,
}

/// Free balance for one currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub currency: String,
    pub free: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_prediction_accepts_legacy_keys() {
        let json = r#"{
            "prediction": "BUY",
            "confidence": 0.81,
            "buy_confidence": 0.66,
            "sell_confidence": 0.34
        }"#;
        let raw: RawPrediction = serde_json::from_str(json).unwrap();
        assert_eq!(raw.predicted_side.as_deref(), Some("BUY"));
        assert_eq!(raw.buy_probability, Some(0.66));
        assert_eq!(raw.sell_probability, Some(0.34));
    }

    #[test]
    fn test_position_parses_numbers_and_strings() {
        let json = r#"{
            "ticker": "BTC-USD",
            "amount_usdc": 150.0,
            "entry_price": "65000",
            "entry_date": "2025-07-30T10:00:00Z"
        }"#;
        let raw: RawPosition = serde_json::from_str(json).unwrap();
        assert_eq!(raw.amount_invested, dec!(150));
        assert_eq!(raw.entry_price, dec!(65000));
        assert_eq!(raw.current_price, None);
    }
}
