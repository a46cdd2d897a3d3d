//! Collaborator data read from a directory of JSON files.
//!
//! Layout:
//! - `predictions.json`: ticker → raw prediction
//! - `balances.json`: list of `{currency, free}`
//! - `positions.json`: list of open positions
//! - `asset_stats.json`: list of asset statistics

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::models::AssetStatistics;
use crate::trading::normalize_ticker;

use super::{BalanceResponse, ForecastSource, PortfolioSource, PredictionsResponse, RawPosition, StatisticsSource};

pub const PREDICTIONS_FILE: &str = "predictions.json";
pub const BALANCES_FILE: &str = "balances.json";
pub const POSITIONS_FILE: &str = "positions.json";
pub const ASSET_STATS_FILE: &str = "asset_stats.json";

/// Reads every collaborator from files written by upstream jobs.
#[derive(Debug, Clone)]
pub struct SnapshotDirSource {
    dir: PathBuf,
}

impl SnapshotDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn read<T: DeserializeOwned>(&self, file: &str) -> Result<T> {
        let path = self.dir.join(file);
        debug!(path = %path.display(), "Reading snapshot file");

        let body = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_slice(&body).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// True when `ticker` is requested; an empty request means everything.
fn requested(tickers: &[String], ticker: &str) -> bool {
    let ticker = normalize_ticker(ticker);
    tickers.is_empty() || tickers.iter().any(|t| normalize_ticker(t) == ticker)
}

#[async_trait]
impl ForecastSource for SnapshotDirSource {
    async fn predict(&self, tickers: &[String]) -> Result<PredictionsResponse> {
        let all: PredictionsResponse = self.read(PREDICTIONS_FILE).await?;
        Ok(all.into_iter().filter(|(t, _)| requested(tickers, t)).collect())
    }
}

#[async_trait]
impl PortfolioSource for SnapshotDirSource {
    async fn get_cash(&self, currency: &str) -> Result<Decimal> {
        let balances: Vec<BalanceResponse> = self.read(BALANCES_FILE).await?;
        let free = balances
            .iter()
            .find(|b| b.currency.eq_ignore_ascii_case(currency))
            .map(|b| b.free)
            .unwrap_or(Decimal::ZERO);
        Ok(free)
    }

    async fn get_open_positions(&self) -> Result<Vec<RawPosition>> {
        self.read(POSITIONS_FILE).await
    }
}

#[async_trait]
impl StatisticsSource for SnapshotDirSource {
    async fn get_statistics(&self, tickers: &[String]) -> Result<Vec<AssetStatistics>> {
        let all: Vec<AssetStatistics> = self.read(ASSET_STATS_FILE).await?;
        Ok(all.into_iter().filter(|s| requested(tickers, &s.ticker)).collect())
    }
}
