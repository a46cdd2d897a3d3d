//! Collaborator clients: forecasts, balances/positions and asset statistics.

mod file_source;
mod http_source;
mod types;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::AssetStatistics;

pub use file_source::SnapshotDirSource;
pub use http_source::HttpSource;
pub use types::*;

/// Black-box forecasting model.
#[async_trait]
pub trait ForecastSource: Send + Sync {
    async fn predict(&self, tickers: &[String]) -> Result<PredictionsResponse>;
}

/// Exchange balances and open positions.
#[async_trait]
pub trait PortfolioSource: Send + Sync {
    async fn get_cash(&self, currency: &str) -> Result<Decimal>;

    async fn get_open_positions(&self) -> Result<Vec<RawPosition>>;
}

/// Historical per-asset statistics.
#[async_trait]
pub trait StatisticsSource: Send + Sync {
    async fn get_statistics(&self, tickers: &[String]) -> Result<Vec<AssetStatistics>>;
}
