//! Decision engine: one pure pass from snapshot to decision set.

use tracing::{debug, info, warn};

use crate::error::EngineResult;
use crate::models::DecisionSet;

use super::allocator::CapitalAllocator;
use super::exits::ExitEvaluator;
use super::reconciler::DecisionReconciler;
use super::snapshot::CycleSnapshot;
use super::EngineConfig;

/// Runs exits, allocation and reconciliation over an immutable snapshot.
///
/// Holds nothing but configuration; every call recomputes from the snapshot.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    config: EngineConfig,
}

impl DecisionEngine {
    /// Create an engine with validated configuration.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn evaluate(&self, snapshot: &CycleSnapshot) -> EngineResult<DecisionSet> {
        let portfolio = &snapshot.portfolio;
        if snapshot.forecasts.is_empty() {
            warn!(positions = portfolio.position_count(), "No usable forecasts this cycle");
        }

        let exits = ExitEvaluator::new(&self.config).evaluate(portfolio, &snapshot.forecasts)?;
        debug!(
            open = exits.len(),
            closing = exits.iter().filter(|e| e.is_closing()).count(),
            "Exit evaluation complete"
        );
        let allocation =
            CapitalAllocator::new(&self.config).allocate(portfolio, &snapshot.forecasts, &snapshot.statistics)?;
        let set = DecisionReconciler::new(&self.config).reconcile(snapshot, exits, &allocation)?;

        let s = &set.summary;
        info!(
            cycle_id = %set.cycle_id,
            signals = snapshot.forecasts.len(),
            buys = s.buy_count,
            sells = s.sell_count,
            holds = s.hold_count,
            rejected = s.rejected_count,
            buy_value = %s.total_buy_value,
            sell_value = %s.total_sell_value,
            projected_cash = %s.projected_cash,
            projected_exposure = %s.projected_exposure,
            "Decision cycle evaluated"
        );

        Ok(set)
    }
}
