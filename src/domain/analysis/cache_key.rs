use crate::domain::analysis::prediction::PredictionParams;
use crate::domain::market::symbol::Symbol;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Key of a memoized prediction.
///
/// Digest over (symbol, canonical parameters, freshness bucket). Two requests
/// inside the same bucket share a result; crossing a bucket boundary forces a
/// fresh computation even before the entry's TTL runs out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    symbol: Symbol,
    bucket: i64,
    digest: String,
}

impl CacheKey {
    /// `bucket_width_ms` of zero disables bucketing
    pub fn new(
        symbol: &Symbol,
        params: &PredictionParams,
        timestamp_ms: i64,
        bucket_width_ms: u64,
    ) -> Self {
        let bucket = if bucket_width_ms == 0 {
            0
        } else {
            timestamp_ms.div_euclid(bucket_width_ms as i64)
        };

        let mut hasher = Sha256::new();
        hasher.update(symbol.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(params.canonical_json().as_bytes());
        hasher.update([0u8]);
        hasher.update(bucket.to_be_bytes());

        Self {
            symbol: symbol.clone(),
            bucket,
            digest: hex::encode(hasher.finalize()),
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn bucket(&self) -> i64 {
        self.bucket
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.symbol, &self.digest[..12.min(self.digest.len())])
    }
}
