//! Data models for signals, statistics, positions, portfolio and decisions.

mod asset;
mod decision;
mod portfolio;
mod position;
mod signal;

pub use asset::AssetStatistics;
pub use decision::{DecisionFlag, DecisionSet, DecisionSummary, TradeAction, TradeDecision};
pub use portfolio::PortfolioState;
pub use position::Position;
pub use signal::{PredictedSide, Signal};
