//! HTTP client for the data service exposing forecasts, balances and statistics.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::models::AssetStatistics;

use super::{BalanceResponse, ForecastSource, PortfolioSource, PredictionsResponse, RawPosition, StatisticsSource};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    tickers: &'a [String],
}

/// Read-only client for the data service.
pub struct HttpSource {
    client: Client,
    base_url: String,
}

impl HttpSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn parse<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} request failed: {} - {}", what, status, body);
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", what))
    }
}

#[async_trait]
impl ForecastSource for HttpSource {
    async fn predict(&self, tickers: &[String]) -> Result<PredictionsResponse> {
        let url = self.url("/predict");
        debug!(url = %url, tickers = tickers.len(), "Requesting forecasts");

        let response = self
            .client
            .post(&url)
            .json(&PredictRequest { tickers })
            .send()
            .await
            .context("Failed to fetch forecasts")?;

        Self::parse(response, "Forecast").await
    }
}

#[async_trait]
impl PortfolioSource for HttpSource {
    async fn get_cash(&self, currency: &str) -> Result<Decimal> {
        let url = self.url("/balance");
        debug!(url = %url, currency = %currency, "Fetching balance");

        let response = self
            .client
            .get(&url)
            .query(&[("currency", currency)])
            .send()
            .await
            .context("Failed to fetch balance")?;

        let balance: BalanceResponse = Self::parse(response, "Balance").await?;
        if !balance.currency.eq_ignore_ascii_case(currency) {
            anyhow::bail!(
                "Balance response for {} while {} was requested",
                balance.currency,
                currency
            );
        }
        Ok(balance.free)
    }

    async fn get_open_positions(&self) -> Result<Vec<RawPosition>> {
        let url = self.url("/positions");
        debug!(url = %url, "Fetching open positions");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch positions")?;

        Self::parse(response, "Positions").await
    }
}

#[async_trait]
impl StatisticsSource for HttpSource {
    async fn get_statistics(&self, tickers: &[String]) -> Result<Vec<AssetStatistics>> {
        let url = self.url("/asset-stats");
        debug!(url = %url, tickers = tickers.len(), "Fetching asset statistics");

        let response = self
            .client
            .get(&url)
            .query(&[("tickers", tickers.join(","))])
            .send()
            .await
            .context("Failed to fetch asset statistics")?;

        Self::parse(response, "Asset statistics").await
    }
}
