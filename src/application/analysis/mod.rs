pub mod context_aggregator;
pub mod indicator_engine;

pub use context_aggregator::{AggregatorConfig, ContextAggregator};
pub use indicator_engine::IndicatorEngine;
