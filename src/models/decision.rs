//! Trade decisions and the per-cycle decision set.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Action the execution collaborator should take for a ticker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
            TradeAction::Hold => "HOLD",
        }
    }
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Machine-readable audit markers attached to a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionFlag {
    /// Open position with no forecast this cycle
    MissingSignal,
    /// BUY candidate without asset statistics
    MissingStatistics,
    /// Forecast record rejected by the adapter
    InvalidForecast,
    /// Candidate could not be funded within the budget
    InsufficientBudget,
    /// Candidate exceeded the simultaneous position cap
    PositionLimit,
    /// Sized amount fell below the minimum trade amount
    BelowMinimumTrade,
    /// Close triggered by the protective stop-loss hook
    StopLoss,
    /// Close triggered by the protective take-profit hook
    TakeProfit,
}

impl DecisionFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionFlag::MissingSignal => "missing_signal",
            DecisionFlag::MissingStatistics => "missing_statistics",
            DecisionFlag::InvalidForecast => "invalid_forecast",
            DecisionFlag::InsufficientBudget => "insufficient_budget",
            DecisionFlag::PositionLimit => "position_limit",
            DecisionFlag::BelowMinimumTrade => "below_minimum_trade",
            DecisionFlag::StopLoss => "stop_loss",
            DecisionFlag::TakeProfit => "take_profit",
        }
    }

    /// Flags marking a candidate the engine declined to act on.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            DecisionFlag::MissingStatistics
                | DecisionFlag::InvalidForecast
                | DecisionFlag::InsufficientBudget
                | DecisionFlag::PositionLimit
                | DecisionFlag::BelowMinimumTrade
        )
    }
}

/// One decision per ticker under consideration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeDecision {
    pub ticker: String,

    pub action: TradeAction,

    /// Fraction of total portfolio value moved by this decision
    pub size_fraction: Decimal,

    /// Quote-currency amount moved by this decision
    pub amount: Decimal,

    /// Model confidence for the ticker, if a signal existed
    pub confidence: Option<f64>,

    /// Human-readable explanation
    pub rationale: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<DecisionFlag>,
}

impl TradeDecision {
    /// Open a new position.
    pub fn buy(
        ticker: &str,
        size_fraction: Decimal,
        amount: Decimal,
        confidence: f64,
        rationale: impl Into<String>,
    ) -> EngineResult<Self> {
        if size_fraction <= Decimal::ZERO || size_fraction > Decimal::ONE {
            return Err(EngineError::invalid_decision(
                ticker,
                format!("BUY size fraction {} outside (0, 1]", size_fraction),
            ));
        }
        if amount <= Decimal::ZERO {
            return Err(EngineError::invalid_decision(
                ticker,
                format!("BUY amount {} must be positive", amount),
            ));
        }
        Self::checked(ticker, TradeAction::Buy, size_fraction, amount, Some(confidence), rationale)
    }

    /// Close an existing position.
    pub fn sell(
        ticker: &str,
        size_fraction: Decimal,
        amount: Decimal,
        confidence: Option<f64>,
        rationale: impl Into<String>,
    ) -> EngineResult<Self> {
        if size_fraction < Decimal::ZERO || size_fraction > Decimal::ONE {
            return Err(EngineError::invalid_decision(
                ticker,
                format!("SELL size fraction {} outside [0, 1]", size_fraction),
            ));
        }
        if amount < Decimal::ZERO {
            return Err(EngineError::invalid_decision(
                ticker,
                format!("SELL amount {} must not be negative", amount),
            ));
        }
        Self::checked(ticker, TradeAction::Sell, size_fraction, amount, confidence, rationale)
    }

    /// Leave the ticker untouched.
    pub fn hold(ticker: &str, confidence: Option<f64>, rationale: impl Into<String>) -> Self {
        Self {
            ticker: ticker.to_string(),
            action: TradeAction::Hold,
            size_fraction: Decimal::ZERO,
            amount: Decimal::ZERO,
            confidence,
            rationale: rationale.into(),
            flags: Vec::new(),
        }
    }

    fn checked(
        ticker: &str,
        action: TradeAction,
        size_fraction: Decimal,
        amount: Decimal,
        confidence: Option<f64>,
        rationale: impl Into<String>,
    ) -> EngineResult<Self> {
        if ticker.trim().is_empty() {
            return Err(EngineError::invalid_decision(ticker, "empty ticker"));
        }
        if let Some(c) = confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(EngineError::invalid_decision(
                    ticker,
                    format!("confidence {} outside [0, 1]", c),
                ));
            }
        }
        Ok(Self {
            ticker: ticker.to_string(),
            action,
            size_fraction,
            amount,
            confidence,
            rationale: rationale.into(),
            flags: Vec::new(),
        })
    }

    /// Attach an audit flag (kept sorted and unique).
    pub fn with_flag(mut self, flag: DecisionFlag) -> Self {
        if let Err(pos) = self.flags.binary_search(&flag) {
            self.flags.insert(pos, flag);
        }
        self
    }

    pub fn has_flag(&self, flag: DecisionFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// HOLD recorded because the engine declined a candidate.
    pub fn is_rejected(&self) -> bool {
        self.action == TradeAction::Hold && self.flags.iter().any(DecisionFlag::is_rejection)
    }
}

/// Aggregates for one decision set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionSummary {
    pub buy_count: usize,
    pub sell_count: usize,
    pub hold_count: usize,
    /// HOLD decisions that carry a rejection flag
    pub rejected_count: usize,
    pub total_buy_value: Decimal,
    pub total_sell_value: Decimal,
    /// Sells minus buys
    pub net_cash_flow: Decimal,
    /// Cash after buys, sells not yet settled
    pub projected_cash: Decimal,
    /// Cash once sells settle
    pub cash_after_settlement: Decimal,
    /// Invested fraction after buys, sells not yet settled
    pub projected_exposure: Decimal,
}

/// Everything the engine decided in one cycle. Unit of persistence and audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionSet {
    /// Fingerprint of the inputs that produced this set
    pub cycle_id: String,

    pub as_of: DateTime<Utc>,

    pub decisions: BTreeMap<String, TradeDecision>,

    pub summary: DecisionSummary,
}

impl DecisionSet {
    /// Ticker → action map consumed by the execution collaborator.
    pub fn actions(&self) -> BTreeMap<String, TradeAction> {
        self.decisions
            .iter()
            .map(|(ticker, d)| (ticker.clone(), d.action))
            .collect()
    }

    pub fn with_action(&self, action: TradeAction) -> impl Iterator<Item = &TradeDecision> {
        self.decisions.values().filter(move |d| d.action == action)
    }

    pub fn get(&self, ticker: &str) -> Option<&TradeDecision> {
        self.decisions.get(ticker)
    }
}
