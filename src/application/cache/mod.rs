pub mod prediction_cache;

pub use prediction_cache::{
    CacheConfig, CacheLookup, CacheStats, InvalidationScope, LookupSource, PredictionCache,
};
