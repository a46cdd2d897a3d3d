//! Exit rules for open positions.
//!
//! A position moves from `Open` to `Closing` when the model calls SELL with
//! enough confidence, or when a configured protective level is hit. Missing
//! forecasts never force a close.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::EngineResult;
use crate::models::{DecisionFlag, PortfolioState, Position, Signal, TradeDecision};

use super::forecast::ForecastBatch;
use super::EngineConfig;

/// Lifecycle of an open position within one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionState {
    Open,
    Closing,
}

/// Reason for exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    ModelSell,
    StopLoss,
    TakeProfit,
}

impl ExitReason {
    fn flag(&self) -> Option<DecisionFlag> {
        match self {
            ExitReason::ModelSell => None,
            ExitReason::StopLoss => Some(DecisionFlag::StopLoss),
            ExitReason::TakeProfit => Some(DecisionFlag::TakeProfit),
        }
    }
}

/// Outcome for one open position.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitEvaluation {
    pub ticker: String,
    pub state: PositionState,
    pub reason: Option<ExitReason>,
    pub decision: TradeDecision,
}

impl ExitEvaluation {
    pub fn is_closing(&self) -> bool {
        self.state == PositionState::Closing
    }
}

/// Evaluates every open position against this cycle's forecasts.
pub struct ExitEvaluator<'a> {
    config: &'a EngineConfig,
}

impl<'a> ExitEvaluator<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// One evaluation per open position, in ticker order.
    pub fn evaluate(
        &self,
        portfolio: &PortfolioState,
        forecasts: &ForecastBatch,
    ) -> EngineResult<Vec<ExitEvaluation>> {
        portfolio
            .positions
            .values()
            .map(|position| self.evaluate_position(position, portfolio, forecasts.get(&position.ticker)))
            .collect()
    }

    fn evaluate_position(
        &self,
        position: &Position,
        portfolio: &PortfolioState,
        signal: Option<&Signal>,
    ) -> EngineResult<ExitEvaluation> {
        let ticker = position.ticker.as_str();
        let confidence = signal.map(|s| s.confidence);

        let exit = self
            .check_model_exit(signal)
            .or_else(|| self.check_protective_exit(position));

        if let Some((reason, rationale)) = exit {
            info!(
                ticker = %ticker,
                reason = ?reason,
                amount = %position.amount_invested,
                "Closing position"
            );

            let mut decision = TradeDecision::sell(
                ticker,
                self.sell_fraction(position, portfolio),
                position.amount_invested,
                confidence,
                rationale,
            )?;
            if let Some(flag) = reason.flag() {
                decision = decision.with_flag(flag);
            }

            return Ok(ExitEvaluation {
                ticker: ticker.to_string(),
                state: PositionState::Closing,
                reason: Some(reason),
                decision,
            });
        }

        let decision = match signal {
            None => {
                warn!(ticker = %ticker, "No forecast for open position, keeping it open");
                TradeDecision::hold(ticker, None, "open position without forecast, kept open")
                    .with_flag(DecisionFlag::MissingSignal)
            }
            Some(s) => {
                debug!(
                    ticker = %ticker,
                    side = s.predicted_side.as_str(),
                    confidence = s.confidence,
                    "Holding position"
                );
                let rationale = if s.is_sell() {
                    format!(
                        "SELL confidence {:.3} below threshold {:.2}, holding",
                        s.confidence, self.config.sell_confidence_threshold
                    )
                } else {
                    format!("{} signal ({:.3}) on open position, holding", s.predicted_side.as_str(), s.confidence)
                };
                TradeDecision::hold(ticker, Some(s.confidence), rationale)
            }
        };

        Ok(ExitEvaluation {
            ticker: ticker.to_string(),
            state: PositionState::Open,
            reason: None,
            decision,
        })
    }

    fn check_model_exit(&self, signal: Option<&Signal>) -> Option<(ExitReason, String)> {
        let s = signal?;
        if s.is_sell() && s.confidence >= self.config.sell_confidence_threshold {
            return Some((
                ExitReason::ModelSell,
                format!(
                    "SELL signal with confidence {:.3} >= {:.2}",
                    s.confidence, self.config.sell_confidence_threshold
                ),
            ));
        }
        None
    }

    /// Stop-loss / take-profit, only when a mark price and a level are present.
    fn check_protective_exit(&self, position: &Position) -> Option<(ExitReason, String)> {
        let return_pct = position.return_pct()?;

        if let Some(stop) = self.config.stop_loss_pct {
            if return_pct <= -stop {
                warn!(
                    ticker = %position.ticker,
                    return_pct = %return_pct,
                    stop = %stop,
                    "Stop loss triggered"
                );
                return Some((
                    ExitReason::StopLoss,
                    format!("stop loss: return {}% <= -{}%", pct(return_pct), pct(stop)),
                ));
            }
        }

        if let Some(target) = self.config.take_profit_pct {
            if return_pct >= target {
                debug!(
                    ticker = %position.ticker,
                    return_pct = %return_pct,
                    target = %target,
                    "Take profit triggered"
                );
                return Some((
                    ExitReason::TakeProfit,
                    format!("take profit: return {}% >= {}%", pct(return_pct), pct(target)),
                ));
            }
        }

        None
    }

    fn sell_fraction(&self, position: &Position, portfolio: &PortfolioState) -> Decimal {
        if portfolio.total_value <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (position.amount_invested / portfolio.total_value)
            .round_dp(6)
            .min(Decimal::ONE)
    }
}

fn pct(value: Decimal) -> Decimal {
    (value * Decimal::ONE_HUNDRED).round_dp(2)
}
