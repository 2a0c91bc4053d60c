// Analysis domain: indicators, contexts and predictions
pub mod cache_key;
pub mod context;
pub mod indicators;
pub mod prediction;

pub use cache_key::CacheKey;
pub use context::{AnalysisContext, ContextFrame, MarketView};
pub use indicators::{IndicatorName, IndicatorSet, TrendBias};
pub use prediction::{
    Completeness, Direction, KeyLevels, PredictionParams, PredictionResult, PriceZone, RiskLevel,
    RiskProfile, StrategyPlan, TradeSignal,
};
