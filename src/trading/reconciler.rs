//! Merges exit and allocation results into the cycle's decision set.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::models::{
    DecisionFlag, DecisionSet, DecisionSummary, PortfolioState, Signal, TradeAction, TradeDecision,
};

use super::allocator::Allocation;
use super::exits::ExitEvaluation;
use super::snapshot::CycleSnapshot;
use super::EngineConfig;

pub struct DecisionReconciler<'a> {
    config: &'a EngineConfig,
}

impl<'a> DecisionReconciler<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// Build the decision set covering signals, positions and rejected forecasts.
    pub fn reconcile(
        &self,
        snapshot: &CycleSnapshot,
        exits: Vec<ExitEvaluation>,
        allocation: &Allocation,
    ) -> EngineResult<DecisionSet> {
        let portfolio = &snapshot.portfolio;
        let mut decisions: BTreeMap<String, TradeDecision> = BTreeMap::new();

        let produced = exits
            .into_iter()
            .map(|e| e.decision)
            .chain(allocation.funded.iter().cloned())
            .chain(allocation.skipped.iter().cloned());
        for decision in produced {
            match decisions.entry(decision.ticker.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(decision);
                }
                Entry::Occupied(existing) => {
                    return Err(EngineError::InvariantViolation(format!(
                        "{} received both {} and {}",
                        decision.ticker,
                        existing.get().action,
                        decision.action
                    )));
                }
            }
        }

        for (ticker, signal) in &snapshot.forecasts.signals {
            if !decisions.contains_key(ticker) {
                decisions.insert(ticker.clone(), self.passive_hold(signal, portfolio));
            }
        }

        for (ticker, reason) in &snapshot.forecasts.rejected {
            let rationale = format!("forecast rejected: {}", reason);
            let decision = match decisions.remove(ticker) {
                Some(mut existing) => {
                    existing.rationale = format!("{}; {}", existing.rationale, rationale);
                    existing
                }
                None => TradeDecision::hold(ticker, None, rationale),
            };
            decisions.insert(ticker.clone(), decision.with_flag(DecisionFlag::InvalidForecast));
        }

        let summary = summarize(&decisions, portfolio);
        self.check_invariants(&decisions, &summary, portfolio, allocation)?;

        let set = DecisionSet {
            cycle_id: fingerprint(snapshot, self.config)?,
            as_of: snapshot.as_of(),
            decisions,
            summary,
        };

        debug!(cycle_id = %set.cycle_id, decisions = set.decisions.len(), "Decision set reconciled");
        Ok(set)
    }

    /// HOLD for a signal that neither closed nor opened anything.
    fn passive_hold(&self, signal: &Signal, portfolio: &PortfolioState) -> TradeDecision {
        let rationale = if signal.is_buy() {
            if portfolio.has_position(&signal.ticker) {
                "BUY signal on ticker already held".to_string()
            } else {
                format!(
                    "BUY confidence {:.3} below threshold {:.2}",
                    signal.confidence, self.config.buy_confidence_threshold
                )
            }
        } else {
            format!("SELL signal ({:.3}) with no open position", signal.confidence)
        };
        TradeDecision::hold(&signal.ticker, Some(signal.confidence), rationale)
    }

    fn check_invariants(
        &self,
        decisions: &BTreeMap<String, TradeDecision>,
        summary: &DecisionSummary,
        portfolio: &PortfolioState,
        allocation: &Allocation,
    ) -> EngineResult<()> {
        let violation = |msg: String| -> EngineResult<()> {
            warn!(reason = %msg, "Decision set rejected");
            Err(EngineError::InvariantViolation(msg))
        };

        if summary.total_buy_value > allocation.budget.budget {
            return violation(format!(
                "BUY total {} exceeds budget {}",
                summary.total_buy_value, allocation.budget.budget
            ));
        }

        for d in decisions.values() {
            match d.action {
                TradeAction::Buy if portfolio.has_position(&d.ticker) => {
                    return violation(format!("BUY for {} which is already held", d.ticker));
                }
                TradeAction::Sell if !portfolio.has_position(&d.ticker) => {
                    return violation(format!("SELL for {} without an open position", d.ticker));
                }
                _ => {}
            }
        }

        // Exposure and reserve bind only what this cycle adds
        if summary.total_buy_value > Decimal::ZERO {
            if summary.projected_exposure > self.config.max_total_invested {
                return violation(format!(
                    "projected exposure {} exceeds {}",
                    summary.projected_exposure, self.config.max_total_invested
                ));
            }
            let reserve = self.config.min_cash_reserve * portfolio.total_value;
            if summary.projected_cash < reserve {
                return violation(format!(
                    "projected cash {} below reserve {}",
                    summary.projected_cash, reserve
                ));
            }
        }

        Ok(())
    }
}

/// Counts and cash projections for a decision map.
pub fn summarize(decisions: &BTreeMap<String, TradeDecision>, portfolio: &PortfolioState) -> DecisionSummary {
    let mut summary = DecisionSummary {
        buy_count: 0,
        sell_count: 0,
        hold_count: 0,
        rejected_count: 0,
        total_buy_value: Decimal::ZERO,
        total_sell_value: Decimal::ZERO,
        net_cash_flow: Decimal::ZERO,
        projected_cash: Decimal::ZERO,
        cash_after_settlement: Decimal::ZERO,
        projected_exposure: Decimal::ZERO,
    };

    for d in decisions.values() {
        match d.action {
            TradeAction::Buy => {
                summary.buy_count += 1;
                summary.total_buy_value += d.amount;
            }
            TradeAction::Sell => {
                summary.sell_count += 1;
                summary.total_sell_value += d.amount;
            }
            TradeAction::Hold => {
                summary.hold_count += 1;
                if d.is_rejected() {
                    summary.rejected_count += 1;
                }
            }
        }
    }

    summary.net_cash_flow = summary.total_sell_value - summary.total_buy_value;
    summary.projected_cash = portfolio.cash_available - summary.total_buy_value;
    summary.cash_after_settlement = portfolio.cash_available + summary.net_cash_flow;
    summary.projected_exposure = if portfolio.total_value > Decimal::ZERO {
        ((portfolio.invested_value() + summary.total_buy_value) / portfolio.total_value).round_dp(6)
    } else {
        Decimal::ZERO
    };

    summary
}

/// SHA-256 over the serialized snapshot and configuration.
pub fn fingerprint(snapshot: &CycleSnapshot, config: &EngineConfig) -> EngineResult<String> {
    let payload = serde_json::to_vec(&(snapshot, config))
        .map_err(|e| EngineError::Fingerprint(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    use crate::models::{Position, PredictedSide};
    use crate::trading::allocator::Budget;
    use crate::trading::exits::{ExitReason, PositionState};
    use crate::trading::forecast::ForecastBatch;

    fn signal(ticker: &str, side: PredictedSide, confidence: f64) -> Signal {
        Signal {
            ticker: ticker.to_string(),
            predicted_side: side,
            confidence,
            buy_probability: 0.5,
            sell_probability: 0.5,
        }
    }

    fn snapshot() -> CycleSnapshot {
        let now = Utc.with_ymd_and_hms(2025, 8, 1, 12, 0, 0).unwrap();
        let mut positions = BTreeMap::new();
        positions.insert("BTC-USD".to_string(), Position::new("BTC-USD", dec!(2000), dec!(60000), now));
        positions.insert("ETH-USD".to_string(), Position::new("ETH-USD", dec!(1000), dec!(3000), now));

        let mut forecasts = ForecastBatch::default();
        for s in [
            signal("BTC-USD", PredictedSide::Sell, 0.8),
            signal("SOL-USD", PredictedSide::Buy, 0.9),
            signal("ADA-USD", PredictedSide::Buy, 0.6),
            signal("XRP-USD", PredictedSide::Sell, 0.9),
        ] {
            forecasts.signals.insert(s.ticker.clone(), s);
        }
        forecasts.rejected.insert("DOGE-USD".to_string(), "confidence 1.4 outside [0, 1]".to_string());
        forecasts.rejected.insert("ETH-USD".to_string(), "missing class probabilities".to_string());

        CycleSnapshot {
            portfolio: PortfolioState::new(dec!(7000), positions, now),
            forecasts,
            statistics: BTreeMap::new(),
        }
    }

    fn exits() -> Vec<ExitEvaluation> {
        vec![
            ExitEvaluation {
                ticker: "BTC-USD".to_string(),
                state: PositionState::Closing,
                reason: Some(ExitReason::ModelSell),
                decision: TradeDecision::sell("BTC-USD", dec!(0.2), dec!(2000), Some(0.8), "sell").unwrap(),
            },
            ExitEvaluation {
                ticker: "ETH-USD".to_string(),
                state: PositionState::Open,
                reason: None,
                decision: TradeDecision::hold("ETH-USD", None, "open position without forecast")
                    .with_flag(DecisionFlag::MissingSignal),
            },
        ]
    }

    fn allocation(funded: Vec<TradeDecision>) -> Allocation {
        allocation_within(dec!(5500), funded)
    }

    fn allocation_within(budget: Decimal, funded: Vec<TradeDecision>) -> Allocation {
        let allocated = funded.iter().map(|d| d.amount).sum();
        Allocation {
            budget: Budget {
                available_for_new_trades: budget,
                headroom: budget,
                budget,
            },
            allocated,
            funded,
            skipped: Vec::new(),
        }
    }

    #[test]
    fn test_reconcile_covers_every_ticker() {
        let config = EngineConfig::default();
        let snap = snapshot();
        let buy = TradeDecision::buy("SOL-USD", dec!(0.08), dec!(800), 0.9, "funded").unwrap();

        let set = DecisionReconciler::new(&config)
            .reconcile(&snap, exits(), &allocation(vec![buy]))
            .unwrap();

        let actions = set.actions();
        assert_eq!(actions.len(), 6);
        assert_eq!(actions["BTC-USD"], TradeAction::Sell);
        assert_eq!(actions["SOL-USD"], TradeAction::Buy);
        assert_eq!(actions["ADA-USD"], TradeAction::Hold);
        assert_eq!(actions["XRP-USD"], TradeAction::Hold);
        assert_eq!(actions["DOGE-USD"], TradeAction::Hold);

        let eth = set.get("ETH-USD").unwrap();
        assert!(eth.has_flag(DecisionFlag::MissingSignal));
        assert!(eth.has_flag(DecisionFlag::InvalidForecast));
        assert!(eth.rationale.contains("missing class probabilities"));
        assert!(set.get("ADA-USD").unwrap().rationale.contains("below threshold"));

        let s = &set.summary;
        assert_eq!((s.buy_count, s.sell_count, s.hold_count), (1, 1, 4));
        assert_eq!(s.rejected_count, 2);
        assert_eq!(s.net_cash_flow, dec!(1200));
        assert_eq!(s.projected_cash, dec!(6200));
        assert_eq!(s.cash_after_settlement, dec!(8200));
        // (3000 + 800) / 10000
        assert_eq!(s.projected_exposure, dec!(0.38));
        assert_eq!(set.cycle_id.len(), 64);
    }

    #[test]
    fn test_buy_on_held_ticker_is_rejected() {
        let config = EngineConfig::default();
        let buy = TradeDecision::buy("ETH-USD", dec!(0.08), dec!(800), 0.9, "funded").unwrap();
        let result = DecisionReconciler::new(&config).reconcile(&snapshot(), Vec::new(), &allocation(vec![buy]));
        assert!(matches!(result, Err(EngineError::InvariantViolation(_))));
    }

    #[test]
    fn test_conflicting_actions_are_rejected() {
        let config = EngineConfig::default();
        let buy = TradeDecision::buy("BTC-USD", dec!(0.08), dec!(800), 0.9, "funded").unwrap();
        let result = DecisionReconciler::new(&config).reconcile(&snapshot(), exits(), &allocation(vec![buy]));
        let err = result.unwrap_err();
        assert!(err.to_string().contains("BTC-USD"));
    }

    #[test]
    fn test_budget_overrun_is_rejected() {
        let config = EngineConfig::default();
        let buy = TradeDecision::buy("SOL-USD", dec!(0.6), dec!(6000), 0.9, "too much").unwrap();
        let result = DecisionReconciler::new(&config).reconcile(&snapshot(), exits(), &allocation(vec![buy]));
        assert!(matches!(result, Err(EngineError::InvariantViolation(_))));
    }

    #[test]
    fn test_fingerprint_tracks_inputs() {
        let config = EngineConfig::default();
        let snap = snapshot();
        assert_eq!(fingerprint(&snap, &config).unwrap(), fingerprint(&snap.clone(), &config).unwrap());

        let tighter = EngineConfig {
            min_trade_amount: dec!(50),
            ..Default::default()
        };
        assert_ne!(fingerprint(&snap, &config).unwrap(), fingerprint(&snap, &tighter).unwrap());
    }

    #[test]
    fn test_sell_without_position_is_rejected() {
        let config = EngineConfig::default();
        let exit = ExitEvaluation {
            ticker: "XRP-USD".to_string(),
            state: PositionState::Closing,
            reason: Some(ExitReason::ModelSell),
            decision: TradeDecision::sell("XRP-USD", dec!(0.05), dec!(500), Some(0.9), "sell").unwrap(),
        };

        let err = DecisionReconciler::new(&config)
            .reconcile(&snapshot(), vec![exit], &allocation(Vec::new()))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
        assert!(err.to_string().contains("without an open position"));
    }

    #[test]
    fn test_exposure_above_limit_is_rejected() {
        let config = EngineConfig::default();
        // Within budget, but (3000 + 6000) / 10000 exceeds 0.85
        let buy = TradeDecision::buy("SOL-USD", dec!(0.6), dec!(6000), 0.9, "oversized").unwrap();

        let err = DecisionReconciler::new(&config)
            .reconcile(&snapshot(), exits(), &allocation_within(dec!(6000), vec![buy]))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
        assert!(err.to_string().contains("projected exposure"));
    }

    #[test]
    fn test_cash_below_reserve_is_rejected() {
        // Loose exposure cap so only the reserve binds: 7000 - 6000 < 1500
        let config = EngineConfig {
            max_total_invested: dec!(0.95),
            ..Default::default()
        };
        let buy = TradeDecision::buy("SOL-USD", dec!(0.6), dec!(6000), 0.9, "drains cash").unwrap();

        let err = DecisionReconciler::new(&config)
            .reconcile(&snapshot(), exits(), &allocation_within(dec!(6000), vec![buy]))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
        assert!(err.to_string().contains("below reserve"));
    }
}
