//! Position sizing: blended Kelly / volatility model with correlation,
//! drawdown and time-of-day adjustments.

use chrono::Timelike;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::models::{AssetStatistics, PortfolioState, Signal};

use super::EngineConfig;

/// Lower/upper bound on the volatility scaling factor.
const VOL_ADJ_MIN: f64 = 0.3;
const VOL_ADJ_MAX: f64 = 2.0;

/// Every intermediate value of one sizing computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeBreakdown {
    /// Full Kelly fraction, `None` when the statistics are degenerate
    pub full_kelly: Option<f64>,
    /// Kelly after safety fraction and confidence scaling (or the fallback)
    pub kelly_component: f64,
    pub volatility_adjustment: f64,
    pub volatility_component: f64,
    /// `min(kelly_component, volatility_component)`
    pub base_fraction: f64,
    pub correlation_bucket: String,
    /// Open positions sharing the bucket
    pub co_held: usize,
    pub correlation_adjustment: f64,
    pub drawdown_adjustment: f64,
    pub time_adjustment: f64,
    /// Product before clamping
    pub raw_fraction: f64,
    /// Final fraction of total portfolio value
    pub fraction: Decimal,
}

impl SizeBreakdown {
    /// Short explanation of how the size came about.
    pub fn rationale(&self) -> String {
        let mut reasons = Vec::new();

        let pct = self.fraction * Decimal::ONE_HUNDRED;
        if self.fraction >= Decimal::new(15, 2) {
            reasons.push(format!("large position {}%: high confidence and favourable conditions", pct.round_dp(2)));
        } else if self.fraction >= Decimal::new(8, 2) {
            reasons.push(format!("standard position {}%", pct.round_dp(2)));
        } else if self.fraction >= Decimal::new(3, 2) {
            reasons.push(format!("small position {}%: moderate confidence", pct.round_dp(2)));
        } else {
            reasons.push(format!("minimal position {}%: low confidence or constraints", pct.round_dp(2)));
        }

        if self.full_kelly.is_none() {
            reasons.push("degenerate statistics, Kelly fell back to minimum size".to_string());
        }
        if self.correlation_adjustment < 1.0 {
            reasons.push(format!(
                "reduced x{} for {} open position(s) in '{}'",
                self.correlation_adjustment, self.co_held, self.correlation_bucket
            ));
        }
        if self.drawdown_adjustment < 1.0 {
            reasons.push(format!("reduced x{} by portfolio drawdown", self.drawdown_adjustment));
        }
        if self.time_adjustment != 1.0 {
            reasons.push(format!("time-of-day x{}", self.time_adjustment));
        }

        reasons.join(" | ")
    }
}

/// Calculator for position sizes. Pure: same inputs, same output.
pub struct PositionSizer<'a> {
    config: &'a EngineConfig,
}

impl<'a> PositionSizer<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// Size a new position for `signal`, as a fraction of total portfolio value.
    ///
    /// The result is always within `[min_position_size, max_position_size]`.
    pub fn calculate(
        &self,
        signal: &Signal,
        stats: &AssetStatistics,
        portfolio: &PortfolioState,
    ) -> SizeBreakdown {
        let (full_kelly, kelly_component) = self.kelly_component(stats, signal.confidence);
        let (volatility_adjustment, volatility_component) =
            self.volatility_component(stats.annualized_volatility);

        // Take the more conservative of the two
        let base_fraction = kelly_component.min(volatility_component);

        let correlation_bucket = self.config.correlation.bucket_of(&signal.ticker).to_string();
        let co_held = portfolio
            .held_tickers()
            .filter(|t| *t != signal.ticker && self.config.correlation.bucket_of(t) == correlation_bucket)
            .count();
        let correlation_adjustment = self.config.correlation.multiplier(co_held);

        let drawdown_adjustment = self.drawdown_adjustment(portfolio);
        let time_adjustment = self.config.time_of_day.multiplier(portfolio.as_of.hour());

        let raw_fraction =
            base_fraction * correlation_adjustment * drawdown_adjustment * time_adjustment;

        SizeBreakdown {
            full_kelly,
            kelly_component,
            volatility_adjustment,
            volatility_component,
            base_fraction,
            correlation_bucket,
            co_held,
            correlation_adjustment,
            drawdown_adjustment,
            time_adjustment,
            raw_fraction,
            fraction: self.clamp(raw_fraction),
        }
    }

    /// Quote-currency amount for a fraction, rounded down to cents.
    pub fn amount_for(&self, fraction: Decimal, portfolio: &PortfolioState) -> Decimal {
        (fraction * portfolio.total_value).round_dp_with_strategy(2, RoundingStrategy::ToZero)
    }

    /// Kelly criterion position sizing.
    ///
    /// f* = (p * b - q) / b
    /// where:
    ///   p = probability of winning (win rate)
    ///   q = probability of losing (1 - p)
    ///   b = ratio of average win to average loss
    fn kelly_component(&self, stats: &AssetStatistics, confidence: f64) -> (Option<f64>, f64) {
        let fallback = (None, self.min_size());

        let p = stats.historical_win_rate;
        if !(p > 0.0 && p < 1.0) {
            return fallback;
        }
        let Some(b) = stats.payoff_ratio() else {
            return fallback;
        };
        if !(b.is_finite() && b > 0.0) {
            return fallback;
        }

        let q = 1.0 - p;
        let kelly = (b * p - q) / b;

        // Safety fraction (quarter Kelly by default) and model confidence
        let confidence = confidence.clamp(0.0, 1.0);
        (Some(kelly), kelly * self.config.base_kelly_fraction * confidence)
    }

    /// Volatility targeting: riskier assets get smaller positions.
    fn volatility_component(&self, asset_volatility: f64) -> (f64, f64) {
        if !(asset_volatility.is_finite() && asset_volatility > 0.0) {
            return (1.0, self.min_size());
        }

        let adjustment = (self.config.target_portfolio_vol / asset_volatility).clamp(VOL_ADJ_MIN, VOL_ADJ_MAX);
        (adjustment, self.config.base_volatility_fraction * adjustment)
    }

    fn drawdown_adjustment(&self, portfolio: &PortfolioState) -> f64 {
        if portfolio.drawdown > self.config.max_drawdown_threshold {
            self.config.drawdown_reduction_factor
        } else {
            1.0
        }
    }

    fn clamp(&self, raw_fraction: f64) -> Decimal {
        let fraction = Decimal::try_from(raw_fraction)
            .map(|d| d.round_dp(6))
            .unwrap_or(self.config.min_position_size);
        fraction
            .max(self.config.min_position_size)
            .min(self.config.max_position_size)
    }

    fn min_size(&self) -> f64 {
        self.config.min_position_size.to_f64().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    use crate::models::{Position, PredictedSide};
    use crate::trading::config::TimeOfDayConfig;

    fn signal(ticker: &str, confidence: f64) -> Signal {
        Signal {
            ticker: ticker.to_string(),
            predicted_side: PredictedSide::Buy,
            confidence,
            buy_probability: 0.7,
            sell_probability: 0.3,
        }
    }

    fn stats(win_rate: f64, avg_win: f64, avg_loss: f64, vol: f64) -> AssetStatistics {
        AssetStatistics {
            ticker: "SOL-USD".to_string(),
            historical_win_rate: win_rate,
            avg_win,
            avg_loss,
            annualized_volatility: vol,
        }
    }

    /// Noon UTC: outside both liquidity windows.
    fn portfolio(held: &[&str]) -> PortfolioState {
        let as_of = Utc.with_ymd_and_hms(2025, 8, 1, 12, 0, 0).unwrap();
        let positions: BTreeMap<String, Position> = held
            .iter()
            .map(|t| (t.to_string(), Position::new(*t, dec!(500), dec!(10), as_of)))
            .collect();
        PortfolioState::new(dec!(10000), positions, as_of)
    }

    /// Wide bounds so component arithmetic is observable.
    fn loose_config() -> EngineConfig {
        EngineConfig {
            min_position_size: dec!(0.005),
            max_position_size: dec!(0.20),
            ..Default::default()
        }
    }

    #[test]
    fn test_volatility_component_binds_and_clamps_to_min() {
        let config = EngineConfig::default();
        let sizer = PositionSizer::new(&config);
        let size = sizer.calculate(&signal("SOL-USD", 0.80), &stats(0.65, 0.08, 0.04, 0.25), &portfolio(&[]));

        // kelly = (2 * 0.65 - 0.35) / 2 = 0.475; x 0.25 x 0.80 = 0.095
        assert!((size.full_kelly.unwrap() - 0.475).abs() < 1e-9);
        assert!((size.kelly_component - 0.095).abs() < 1e-9);
        // 0.05 x clamp(0.15 / 0.25) = 0.03
        assert!((size.volatility_adjustment - 0.6).abs() < 1e-9);
        assert!((size.volatility_component - 0.03).abs() < 1e-9);
        assert!((size.base_fraction - 0.03).abs() < 1e-9);
        // Clamped up to the 8% minimum
        assert_eq!(size.fraction, dec!(0.08));
    }

    #[test]
    fn test_kelly_binds_with_loose_bounds() {
        let config = loose_config();
        let sizer = PositionSizer::new(&config);
        // Low volatility: vol component = 0.05 x 2.0 = 0.10
        let size = sizer.calculate(&signal("SOL-USD", 0.5), &stats(0.55, 0.05, 0.05, 0.05), &portfolio(&[]));

        // kelly = (0.55 - 0.45) / 1 = 0.10; x 0.25 x 0.5 = 0.0125
        assert!((size.volatility_component - 0.10).abs() < 1e-9);
        assert!((size.kelly_component - 0.0125).abs() < 1e-9);
        assert_eq!(size.fraction, dec!(0.0125));
    }

    #[test]
    fn test_degenerate_statistics_fall_back_to_minimum() {
        let config = loose_config();
        let sizer = PositionSizer::new(&config);
        let p = portfolio(&[]);

        for s in [
            stats(0.6, 0.08, 0.0, 0.25),
            stats(0.6, 0.08, -0.04, 0.25),
            stats(0.0, 0.08, 0.04, 0.25),
            stats(1.0, 0.08, 0.04, 0.25),
            stats(f64::NAN, 0.08, 0.04, 0.25),
        ] {
            let size = sizer.calculate(&signal("SOL-USD", 0.9), &s, &p);
            assert!(size.full_kelly.is_none());
            assert!((size.kelly_component - 0.005).abs() < 1e-12);
            assert_eq!(size.fraction, dec!(0.005));
        }
    }

    #[test]
    fn test_correlation_adjustment_counts_bucket_members() {
        let config = loose_config();
        let sizer = PositionSizer::new(&config);
        let s = stats(0.55, 0.05, 0.05, 0.05);

        let alone = sizer.calculate(&signal("SOL-USD", 0.5), &s, &portfolio(&["BTC-USD"]));
        assert_eq!(alone.correlation_bucket, "alt_majors");
        assert_eq!(alone.co_held, 0);
        assert_eq!(alone.correlation_adjustment, 1.0);

        let one = sizer.calculate(&signal("SOL-USD", 0.5), &s, &portfolio(&["ADA-USD", "BTC-USD"]));
        assert_eq!(one.co_held, 1);
        assert_eq!(one.correlation_adjustment, 0.8);
        assert_eq!(one.fraction, dec!(0.01));

        let crowded = sizer.calculate(
            &signal("SOL-USD", 0.5),
            &s,
            &portfolio(&["ADA-USD", "AVAX-USD", "DOT-USD"]),
        );
        assert_eq!(crowded.co_held, 3);
        assert_eq!(crowded.correlation_adjustment, 0.4);
        assert!(crowded.rationale().contains("alt_majors"));
    }

    #[test]
    fn test_drawdown_reduction() {
        let config = loose_config();
        let sizer = PositionSizer::new(&config);
        let s = stats(0.55, 0.05, 0.05, 0.05);

        let calm = portfolio(&[]).with_equity_peak(dec!(10500));
        let size = sizer.calculate(&signal("SOL-USD", 0.5), &s, &calm);
        assert_eq!(size.drawdown_adjustment, 1.0);

        let stressed = portfolio(&[]).with_equity_peak(dec!(12000));
        let size = sizer.calculate(&signal("SOL-USD", 0.5), &s, &stressed);
        assert_eq!(size.drawdown_adjustment, 0.5);
        assert_eq!(size.fraction, dec!(0.00625));
        assert!(size.rationale().contains("drawdown"));
    }

    #[test]
    fn test_time_of_day_uses_snapshot_hour() {
        let config = loose_config();
        let sizer = PositionSizer::new(&config);
        let s = stats(0.55, 0.05, 0.05, 0.05);

        let mut night = portfolio(&[]);
        night.as_of = Utc.with_ymd_and_hms(2025, 8, 1, 3, 30, 0).unwrap();
        assert_eq!(sizer.calculate(&signal("SOL-USD", 0.5), &s, &night).time_adjustment, 0.7);

        let mut overlap = portfolio(&[]);
        overlap.as_of = Utc.with_ymd_and_hms(2025, 8, 1, 15, 0, 0).unwrap();
        assert_eq!(sizer.calculate(&signal("SOL-USD", 0.5), &s, &overlap).time_adjustment, 1.2);

        let disabled = EngineConfig {
            time_of_day: TimeOfDayConfig { enabled: false, ..Default::default() },
            ..loose_config()
        };
        let sizer = PositionSizer::new(&disabled);
        assert_eq!(sizer.calculate(&signal("SOL-USD", 0.5), &s, &night).time_adjustment, 1.0);
    }

    #[test]
    fn test_amount_rounds_down_to_cents() {
        let config = EngineConfig::default();
        let sizer = PositionSizer::new(&config);
        let mut p = portfolio(&[]);
        p.total_value = dec!(1234.567);
        assert_eq!(sizer.amount_for(dec!(0.1), &p), dec!(123.45));
    }

    proptest! {
        #[test]
        fn prop_size_within_bounds(
            confidence in 0.0f64..=1.0,
            win_rate in -0.5f64..1.5,
            avg_win in -0.2f64..0.5,
            avg_loss in -0.2f64..0.5,
            vol in -0.5f64..3.0,
            hour in 0u32..24,
            peak in 10000u32..30000,
        ) {
            let config = EngineConfig::default();
            let sizer = PositionSizer::new(&config);
            let mut p = portfolio(&["BTC-USD", "ETH-USD"]).with_equity_peak(Decimal::from(peak));
            p.as_of = Utc.with_ymd_and_hms(2025, 8, 1, hour, 0, 0).unwrap();

            let size = sizer.calculate(
                &signal("BTC-USD", confidence),
                &stats(win_rate, avg_win, avg_loss, vol),
                &p,
            );
            prop_assert!(size.fraction >= config.min_position_size);
            prop_assert!(size.fraction <= config.max_position_size);
        }

        #[test]
        fn prop_size_monotone_in_confidence(
            c1 in 0.0f64..=1.0,
            c2 in 0.0f64..=1.0,
            win_rate in 0.01f64..0.99,
            avg_win in 0.001f64..0.5,
            avg_loss in 0.001f64..0.5,
            vol in 0.01f64..2.0,
        ) {
            let config = loose_config();
            let sizer = PositionSizer::new(&config);
            let p = portfolio(&["ADA-USD"]);
            let s = stats(win_rate, avg_win, avg_loss, vol);

            let (lo, hi) = if c1 <= c2 { (c1, c2) } else { (c2, c1) };
            let small = sizer.calculate(&signal("SOL-USD", lo), &s, &p);
            let large = sizer.calculate(&signal("SOL-USD", hi), &s, &p);
            prop_assert!(small.fraction <= large.fraction);
        }
    }
}
