//! Engine configuration.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Bucket assigned to tickers missing from the correlation table.
pub const DEFAULT_BUCKET: &str = "other";

/// Configuration for sizing, exits and capital allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // === Signal thresholds ===
    /// Minimum confidence for a BUY signal to become a candidate
    pub buy_confidence_threshold: f64,

    /// Minimum confidence for a SELL signal to close a position
    pub sell_confidence_threshold: f64,

    // === Position sizing ===
    /// Smallest position as a fraction of total value
    pub min_position_size: Decimal,

    /// Largest position as a fraction of total value
    pub max_position_size: Decimal,

    /// Safety multiplier applied to the full Kelly fraction (0.25 = quarter Kelly)
    pub base_kelly_fraction: f64,

    /// Fraction scaled by the volatility adjustment
    pub base_volatility_fraction: f64,

    /// Annualized volatility the portfolio aims for
    pub target_portfolio_vol: f64,

    /// Drawdown above which new positions are reduced (0-1)
    pub max_drawdown_threshold: Decimal,

    /// Multiplier applied while the drawdown threshold is exceeded
    pub drawdown_reduction_factor: f64,

    pub time_of_day: TimeOfDayConfig,

    pub correlation: CorrelationConfig,

    // === Portfolio limits ===
    /// Maximum fraction of total value invested in positions
    pub max_total_invested: Decimal,

    /// Fraction of total value always kept in cash
    pub min_cash_reserve: Decimal,

    /// Cap on open plus newly funded positions
    pub max_simultaneous_positions: usize,

    /// Smallest order worth sending, in quote currency
    pub min_trade_amount: Decimal,

    // === Protective exits (disabled unless set) ===
    /// Close when the marked return falls to -stop_loss_pct
    pub stop_loss_pct: Option<Decimal>,

    /// Close when the marked return reaches take_profit_pct
    pub take_profit_pct: Option<Decimal>,

    // === Universe ===
    /// Currency whose free balance counts as cash
    pub quote_currency: String,

    /// Tickers to request forecasts for
    pub universe: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buy_confidence_threshold: 0.75,
            sell_confidence_threshold: 0.70,

            min_position_size: dec!(0.08),     // 8% min per position
            max_position_size: dec!(0.15),     // 15% max per position
            base_kelly_fraction: 0.25,         // Quarter Kelly
            base_volatility_fraction: 0.05,    // 5% before volatility scaling
            target_portfolio_vol: 0.15,        // 15% annualized
            max_drawdown_threshold: dec!(0.10),
            drawdown_reduction_factor: 0.5,
            time_of_day: TimeOfDayConfig::default(),
            correlation: CorrelationConfig::default(),

            max_total_invested: dec!(0.85),
            min_cash_reserve: dec!(0.15),
            max_simultaneous_positions: 8,
            min_trade_amount: dec!(30),

            stop_loss_pct: None,
            take_profit_pct: None,

            quote_currency: "USDT".to_string(),
            universe: default_universe(),
        }
    }
}

/// Liquidity-window multipliers keyed on the snapshot hour (UTC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeOfDayConfig {
    pub enabled: bool,
    /// Low-liquidity window, inclusive hours
    pub off_hours_start: u32,
    pub off_hours_end: u32,
    pub off_hours_multiplier: f64,
    /// Traditional-market overlap window, inclusive hours
    pub overlap_start: u32,
    pub overlap_end: u32,
    pub overlap_multiplier: f64,
}

impl Default for TimeOfDayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            off_hours_start: 2,
            off_hours_end: 6,
            off_hours_multiplier: 0.7,
            overlap_start: 14,
            overlap_end: 16,
            overlap_multiplier: 1.2,
        }
    }
}

impl TimeOfDayConfig {
    /// Multiplier for a given hour of day.
    pub fn multiplier(&self, hour: u32) -> f64 {
        if !self.enabled {
            return 1.0;
        }
        if (self.off_hours_start..=self.off_hours_end).contains(&hour) {
            self.off_hours_multiplier
        } else if (self.overlap_start..=self.overlap_end).contains(&hour) {
            self.overlap_multiplier
        } else {
            1.0
        }
    }
}

/// Correlated-asset buckets and the size multiplier per co-held count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Bucket name → member tickers
    pub buckets: BTreeMap<String, Vec<String>>,

    /// Multiplier for 0, 1, 2, ... co-held positions; the last entry repeats
    pub multipliers: Vec<f64>,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        let mut buckets = BTreeMap::new();
        buckets.insert("majors".to_string(), tickers(&["BTC-USD", "ETH-USD"]));
        buckets.insert(
            "alt_majors".to_string(),
            tickers(&["ADA-USD", "SOL-USD", "AVAX-USD", "DOT-USD"]),
        );
        buckets.insert(
            "defi".to_string(),
            tickers(&["UNI-USD", "AAVE-USD", "LINK-USD"]),
        );

        Self {
            buckets,
            multipliers: vec![1.0, 0.8, 0.6, 0.4],
        }
    }
}

impl CorrelationConfig {
    /// Bucket a ticker belongs to.
    pub fn bucket_of(&self, ticker: &str) -> &str {
        self.buckets
            .iter()
            .find(|(_, members)| members.iter().any(|m| m == ticker))
            .map(|(name, _)| name.as_str())
            .unwrap_or(DEFAULT_BUCKET)
    }

    /// Multiplier for the number of co-held positions in the same bucket.
    pub fn multiplier(&self, co_held: usize) -> f64 {
        match self.multipliers.get(co_held) {
            Some(m) => *m,
            None => self.multipliers.last().copied().unwrap_or(1.0),
        }
    }
}

fn tickers(list: &[&str]) -> Vec<String> {
    list.iter().map(|t| t.to_string()).collect()
}

fn default_universe() -> Vec<String> {
    tickers(&[
        "BTC-USD", "ETH-USD", "BNB-USD", "SOL-USD", "XRP-USD", "DOGE-USD", "ADA-USD",
        "AVAX-USD", "SHIB-USD", "DOT-USD", "LINK-USD", "TRX-USD", "MATIC-USD", "BCH-USD",
        "ICP-USD", "NEAR-USD", "UNI-USD", "LTC-USD", "AAVE-USD", "FTM-USD", "XLM-USD",
        "GRT-USD", "RNDR-USD", "HBAR-USD", "FIL-USD", "VET-USD", "INJ-USD", "OP-USD",
        "TIA-USD", "RUNE-USD",
    ])
}

impl EngineConfig {
    /// Load configuration.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (`CRYPTONITA__MIN_TRADE_AMOUNT=50`)
    /// 2. Configuration file (TOML), when present
    /// 3. Built-in defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if path.exists() {
                builder = builder.add_source(File::from(path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("CRYPTONITA")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("universe")
                .try_parsing(true),
        );

        let config: EngineConfig = builder
            .build()
            .context("Failed to read configuration sources")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range or inconsistent values.
    pub fn validate(&self) -> EngineResult<()> {
        fn unit_f64(name: &str, v: f64) -> EngineResult<()> {
            if !(0.0..=1.0).contains(&v) {
                return Err(EngineError::InvalidConfig(format!("{} must be in [0, 1], got {}", name, v)));
            }
            Ok(())
        }
        fn unit_dec(name: &str, v: Decimal) -> EngineResult<()> {
            if v < Decimal::ZERO || v > Decimal::ONE {
                return Err(EngineError::InvalidConfig(format!("{} must be in [0, 1], got {}", name, v)));
            }
            Ok(())
        }
        fn positive(name: &str, v: f64) -> EngineResult<()> {
            if !(v.is_finite() && v > 0.0) {
                return Err(EngineError::InvalidConfig(format!("{} must be positive, got {}", name, v)));
            }
            Ok(())
        }

        unit_f64("buy_confidence_threshold", self.buy_confidence_threshold)?;
        unit_f64("sell_confidence_threshold", self.sell_confidence_threshold)?;
        unit_dec("min_position_size", self.min_position_size)?;
        unit_dec("max_position_size", self.max_position_size)?;
        unit_dec("max_total_invested", self.max_total_invested)?;
        unit_dec("min_cash_reserve", self.min_cash_reserve)?;
        unit_dec("max_drawdown_threshold", self.max_drawdown_threshold)?;

        if self.min_position_size <= Decimal::ZERO {
            return Err(EngineError::InvalidConfig("min_position_size must be positive".into()));
        }
        if self.min_position_size > self.max_position_size {
            return Err(EngineError::InvalidConfig(format!(
                "min_position_size {} exceeds max_position_size {}",
                self.min_position_size, self.max_position_size
            )));
        }
        if self.max_simultaneous_positions == 0 {
            return Err(EngineError::InvalidConfig("max_simultaneous_positions must be at least 1".into()));
        }
        if self.min_trade_amount < Decimal::ZERO {
            return Err(EngineError::InvalidConfig("min_trade_amount must not be negative".into()));
        }

        positive("base_kelly_fraction", self.base_kelly_fraction)?;
        unit_f64("base_kelly_fraction", self.base_kelly_fraction)?;
        positive("base_volatility_fraction", self.base_volatility_fraction)?;
        positive("target_portfolio_vol", self.target_portfolio_vol)?;
        positive("drawdown_reduction_factor", self.drawdown_reduction_factor)?;

        let tod = &self.time_of_day;
        for (name, hour) in [
            ("off_hours_start", tod.off_hours_start),
            ("off_hours_end", tod.off_hours_end),
            ("overlap_start", tod.overlap_start),
            ("overlap_end", tod.overlap_end),
        ] {
            if hour > 23 {
                return Err(EngineError::InvalidConfig(format!("time_of_day.{} must be 0-23, got {}", name, hour)));
            }
        }
        positive("time_of_day.off_hours_multiplier", tod.off_hours_multiplier)?;
        positive("time_of_day.overlap_multiplier", tod.overlap_multiplier)?;

        if self.correlation.multipliers.is_empty() {
            return Err(EngineError::InvalidConfig("correlation.multipliers must not be empty".into()));
        }
        for m in &self.correlation.multipliers {
            positive("correlation.multipliers", *m)?;
        }
        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        for (bucket, members) in &self.correlation.buckets {
            for ticker in members {
                if let Some(other) = seen.insert(ticker.as_str(), bucket.as_str()) {
                    return Err(EngineError::InvalidConfig(format!(
                        "{} is listed in both '{}' and '{}' buckets",
                        ticker, other, bucket
                    )));
                }
            }
        }

        for (name, pct) in [("stop_loss_pct", self.stop_loss_pct), ("take_profit_pct", self.take_profit_pct)] {
            if let Some(p) = pct {
                if p <= Decimal::ZERO {
                    return Err(EngineError::InvalidConfig(format!("{} must be positive, got {}", name, p)));
                }
            }
        }

        if self.quote_currency.trim().is_empty() {
            return Err(EngineError::InvalidConfig("quote_currency must not be empty".into()));
        }

        Ok(())
    }
}
