//! Trading logic: forecasts, sizing, exits, capital allocation and the decision pass.

mod allocator;
mod config;
mod engine;
mod exits;
mod export;
mod forecast;
mod position_sizer;
mod reconciler;
mod snapshot;

pub use self::config::EngineConfig;
pub use engine::DecisionEngine;
pub use export::{DecisionSink, JsonExporter};
pub use forecast::{normalize_ticker, ForecastAdapter};
pub use position_sizer::PositionSizer;
pub use snapshot::{CycleSnapshot, SnapshotBuilder};
