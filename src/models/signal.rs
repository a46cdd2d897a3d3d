//! Normalized forecast for one ticker.

use serde::{Deserialize, Serialize};

/// Direction predicted by the forecasting model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PredictedSide {
    Buy,
    Sell,
}

impl PredictedSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictedSide::Buy => "BUY",
            PredictedSide::Sell => "SELL",
        }
    }

    /// Parse the labels the classifier is known to emit.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_uppercase().as_str() {
            "BUY" | "LONG" | "1" => Some(Self::Buy),
            "SELL" | "SHORT" | "0" => Some(Self::Sell),
            _ => None,
        }
    }
}

/// Model output for one ticker after normalization.
///
/// Signals are produced fresh every cycle and never outlive it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub ticker: String,

    pub predicted_side: PredictedSide,

    /// Meta-model confidence in the predicted side (0.0 to 1.0)
    pub confidence: f64,

    /// Primary model class probability for BUY
    pub buy_probability: f64,

    /// Primary model class probability for SELL
    pub sell_probability: f64,
}

impl Signal {
    pub fn is_buy(&self) -> bool {
        self.predicted_side == PredictedSide::Buy
    }

    pub fn is_sell(&self) -> bool {
        self.predicted_side == PredictedSide::Sell
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_side_labels() {
        assert_eq!(PredictedSide::parse("buy"), Some(PredictedSide::Buy));
        assert_eq!(PredictedSide::parse(" SELL "), Some(PredictedSide::Sell));
        assert_eq!(PredictedSide::parse("1"), Some(PredictedSide::Buy));
        assert_eq!(PredictedSide::parse("0"), Some(PredictedSide::Sell));
        assert_eq!(PredictedSide::parse("hold"), None);
    }
}
