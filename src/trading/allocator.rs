//! Capital allocation across competing BUY candidates.
//!
//! Candidates are funded greedily in confidence order until the budget or
//! the position slots run out. This is not a knapsack optimum: the first
//! candidate that does not fit stops allocation, which keeps the outcome
//! simple to audit.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::EngineResult;
use crate::models::{AssetStatistics, DecisionFlag, PortfolioState, Signal, TradeDecision};

use super::forecast::ForecastBatch;
use super::position_sizer::PositionSizer;
use super::EngineConfig;

/// Capital limits for new positions this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Budget {
    /// Cash above the reserve
    pub available_for_new_trades: Decimal,
    /// Room below the maximum invested fraction
    pub headroom: Decimal,
    /// `min(available_for_new_trades, headroom)`
    pub budget: Decimal,
}

impl Budget {
    pub fn compute(portfolio: &PortfolioState, config: &EngineConfig) -> Self {
        let reserve = config.min_cash_reserve * portfolio.total_value;
        let available_for_new_trades = (portfolio.cash_available - reserve).max(Decimal::ZERO);

        let max_invested = config.max_total_invested * portfolio.total_value;
        let headroom = (max_invested - portfolio.invested_value()).max(Decimal::ZERO);

        Self {
            available_for_new_trades,
            headroom,
            budget: available_for_new_trades.min(headroom),
        }
    }
}

/// Result of one allocation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub budget: Budget,
    /// Sum of funded BUY amounts
    pub allocated: Decimal,
    /// BUY decisions, in funding order
    pub funded: Vec<TradeDecision>,
    /// HOLD decisions for eligible candidates that were not funded
    pub skipped: Vec<TradeDecision>,
}

impl Allocation {
    pub fn remaining(&self) -> Decimal {
        self.budget.budget - self.allocated
    }
}

/// Funds BUY candidates within the portfolio's budget and position cap.
pub struct CapitalAllocator<'a> {
    config: &'a EngineConfig,
    sizer: PositionSizer<'a>,
}

impl<'a> CapitalAllocator<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self {
            config,
            sizer: PositionSizer::new(config),
        }
    }

    /// Whether a signal may open a new position.
    pub fn is_eligible(&self, signal: &Signal, portfolio: &PortfolioState) -> bool {
        signal.is_buy()
            && signal.confidence >= self.config.buy_confidence_threshold
            && !portfolio.has_position(&signal.ticker)
    }

    /// Eligible candidates, highest confidence first, ties by ticker.
    pub fn rank_candidates<'s>(
        &self,
        forecasts: &'s ForecastBatch,
        portfolio: &PortfolioState,
    ) -> Vec<&'s Signal> {
        let mut candidates: Vec<&Signal> = forecasts
            .signals
            .values()
            .filter(|s| self.is_eligible(s, portfolio))
            .collect();
        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.ticker.cmp(&b.ticker))
        });
        candidates
    }

    pub fn allocate(
        &self,
        portfolio: &PortfolioState,
        forecasts: &ForecastBatch,
        statistics: &BTreeMap<String, AssetStatistics>,
    ) -> EngineResult<Allocation> {
        let budget = Budget::compute(portfolio, self.config);
        let candidates = self.rank_candidates(forecasts, portfolio);

        info!(
            candidates = candidates.len(),
            available = %budget.available_for_new_trades,
            headroom = %budget.headroom,
            budget = %budget.budget,
            "Allocating capital"
        );

        let mut allocation = Allocation {
            budget,
            allocated: Decimal::ZERO,
            funded: Vec::new(),
            skipped: Vec::new(),
        };

        let mut slots = self
            .config
            .max_simultaneous_positions
            .saturating_sub(portfolio.position_count());
        let budget_too_small = budget.budget < self.config.min_trade_amount;
        let mut halted = false;

        for signal in candidates {
            let ticker = signal.ticker.as_str();

            let Some(stats) = statistics.get(ticker) else {
                allocation.skipped.push(self.skip(
                    signal,
                    DecisionFlag::MissingStatistics,
                    "missing asset statistics".to_string(),
                ));
                continue;
            };

            if budget_too_small {
                allocation.skipped.push(self.skip(
                    signal,
                    DecisionFlag::InsufficientBudget,
                    format!(
                        "insufficient budget: {} below minimum trade amount {}",
                        budget.budget, self.config.min_trade_amount
                    ),
                ));
                continue;
            }

            if halted {
                allocation.skipped.push(self.skip(
                    signal,
                    DecisionFlag::InsufficientBudget,
                    format!(
                        "insufficient budget: allocation stopped at a higher-confidence candidate, {} remaining",
                        allocation.remaining()
                    ),
                ));
                continue;
            }

            if slots == 0 {
                allocation.skipped.push(self.skip(
                    signal,
                    DecisionFlag::PositionLimit,
                    format!(
                        "position limit reached: {} simultaneous positions",
                        self.config.max_simultaneous_positions
                    ),
                ));
                continue;
            }

            let size = self.sizer.calculate(signal, stats, portfolio);
            let amount = self.sizer.amount_for(size.fraction, portfolio);

            if amount <= Decimal::ZERO || amount < self.config.min_trade_amount {
                allocation.skipped.push(self.skip(
                    signal,
                    DecisionFlag::BelowMinimumTrade,
                    format!(
                        "below minimum trade amount: {} < {}",
                        amount, self.config.min_trade_amount
                    ),
                ));
                continue;
            }

            if allocation.allocated + amount > budget.budget {
                halted = true;
                allocation.skipped.push(self.skip(
                    signal,
                    DecisionFlag::InsufficientBudget,
                    format!(
                        "insufficient budget: needs {}, {} remaining",
                        amount,
                        allocation.remaining()
                    ),
                ));
                continue;
            }

            info!(
                ticker = %ticker,
                confidence = signal.confidence,
                fraction = %size.fraction,
                amount = %amount,
                "Funding candidate"
            );

            allocation.allocated += amount;
            slots -= 1;
            allocation.funded.push(TradeDecision::buy(
                ticker,
                size.fraction,
                amount,
                signal.confidence,
                size.rationale(),
            )?);
        }

        debug!(
            funded = allocation.funded.len(),
            skipped = allocation.skipped.len(),
            allocated = %allocation.allocated,
            "Allocation complete"
        );

        Ok(allocation)
    }

    fn skip(&self, signal: &Signal, flag: DecisionFlag, rationale: String) -> TradeDecision {
        info!(ticker = %signal.ticker, reason = %rationale, "Skipping candidate");
        TradeDecision::hold(&signal.ticker, Some(signal.confidence), rationale).with_flag(flag)
    }
}
