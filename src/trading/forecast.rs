//! Forecast adapter: raw classifier output → validated `Signal`s.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::{PredictionsResponse, RawPrediction};
use crate::models::{PredictedSide, Signal};

/// Normalized forecasts for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForecastBatch {
    /// Valid signals keyed by normalized ticker
    pub signals: BTreeMap<String, Signal>,

    /// Tickers whose forecast was rejected, with the reason
    pub rejected: BTreeMap<String, String>,
}

impl ForecastBatch {
    pub fn get(&self, ticker: &str) -> Option<&Signal> {
        self.signals.get(ticker)
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

/// Canonical ticker form used across the engine.
pub fn normalize_ticker(ticker: &str) -> String {
    ticker.trim().to_uppercase()
}

/// Converts raw model output into signals.
pub struct ForecastAdapter;

impl ForecastAdapter {
    /// Normalize a batch. Invalid records are rejected, never fatal.
    pub fn normalize(raw: &PredictionsResponse) -> ForecastBatch {
        let mut batch = ForecastBatch::default();

        for (raw_ticker, prediction) in raw {
            let ticker = normalize_ticker(raw_ticker);
            if ticker.is_empty() {
                warn!(raw_ticker = %raw_ticker, "Dropping forecast with empty ticker");
                continue;
            }

            if batch.rejected.contains_key(&ticker) {
                continue;
            }
            if batch.signals.remove(&ticker).is_some() {
                warn!(ticker = %ticker, "Conflicting duplicate forecasts");
                batch
                    .rejected
                    .insert(ticker, "conflicting duplicate forecasts".to_string());
                continue;
            }

            match Self::normalize_one(&ticker, prediction) {
                Ok(signal) => {
                    debug!(
                        ticker = %ticker,
                        side = signal.predicted_side.as_str(),
                        confidence = signal.confidence,
                        "Forecast accepted"
                    );
                    batch.signals.insert(ticker, signal);
                }
                Err(reason) => {
                    warn!(ticker = %ticker, reason = %reason, "Forecast rejected");
                    batch.rejected.insert(ticker, reason);
                }
            }
        }

        batch
    }

    fn normalize_one(ticker: &str, raw: &RawPrediction) -> Result<Signal, String> {
        let confidence = unit_interval("confidence", raw.confidence)?;

        let buy = raw.buy_probability.map(|p| unit_interval("buy_probability", p)).transpose()?;
        let sell = raw.sell_probability.map(|p| unit_interval("sell_probability", p)).transpose()?;
        let (buy_probability, sell_probability) = match (buy, sell) {
            (Some(b), Some(s)) => (b, s),
            (Some(b), None) => (b, 1.0 - b),
            (None, Some(s)) => (1.0 - s, s),
            (None, None) => return Err("missing class probabilities".to_string()),
        };

        let predicted_side = match raw.predicted_side.as_deref() {
            Some(label) => PredictedSide::parse(label)
                .ok_or_else(|| format!("unknown predicted side '{}'", label))?,
            // argmax over [SELL, BUY]; ties resolve to SELL
            None if buy_probability > sell_probability => PredictedSide::Buy,
            None => PredictedSide::Sell,
        };

        Ok(Signal {
            ticker: ticker.to_string(),
            predicted_side,
            confidence,
            buy_probability,
            sell_probability,
        })
    }
}

fn unit_interval(name: &str, value: f64) -> Result<f64, String> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("{} {} outside [0, 1]", name, value))
    }
}
