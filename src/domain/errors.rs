use crate::domain::analysis::indicators::IndicatorName;
use crate::domain::market::timeframe::Timeframe;
use thiserror::Error;

/// Errors raised while fetching raw market data from a provider
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("Market data unavailable for {symbol}: {reason}")]
    DataUnavailable { symbol: String, reason: String },

    #[error("Rate limited by {provider}: retry after {retry_after_ms:?}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Market data request timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("Market data request cancelled")]
    Cancelled,
}

impl FetchError {
    /// Rate limits and timeouts are worth another attempt, everything else is final
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. } | FetchError::Timeout { .. })
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            FetchError::RateLimited { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

/// What makes a snapshot series unusable for indicator computation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SnapshotDefect {
    #[error("{indicator} needs {required} samples, got {actual}")]
    TooShort {
        indicator: IndicatorName,
        required: usize,
        actual: usize,
    },

    #[error("candle {index} is malformed: {reason}")]
    MalformedCandle { index: usize, reason: String },
}

/// Errors raised while turning snapshots into an analysis context.
///
/// None of these are retried: they describe bad or insufficient input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregationError {
    #[error("Invalid snapshot for {symbol} {timeframe}: {defect}")]
    InvalidSnapshot {
        symbol: String,
        timeframe: Timeframe,
        defect: SnapshotDefect,
    },

    #[error("Stale data for {symbol}: snapshot age {age_ms}ms > limit {threshold_ms}ms")]
    StaleData {
        symbol: String,
        age_ms: u64,
        threshold_ms: u64,
    },

    #[error("Incomplete data for {symbol}: {reason}")]
    IncompleteData { symbol: String, reason: String },
}

/// Errors raised by the language-model inference path
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    #[error("Inference provider rejected the request: {reason}")]
    ProviderError { reason: String },

    #[error("Inference provider timed out after {duration_ms}ms")]
    ProviderTimeout { duration_ms: u64 },

    #[error("Inference stream interrupted: {reason}")]
    StreamInterrupted { reason: String },

    /// `timed_out` is set when every attempt ended in a timeout or an empty interruption
    #[error("Inference failed after {attempts} attempt(s): {reason}")]
    InferenceFailed {
        attempts: u32,
        reason: String,
        timed_out: bool,
    },

    #[error("Inference cancelled")]
    Cancelled,
}

/// Terminal error of a single-symbol prediction.
///
/// Cloneable so that every waiter of a shared computation receives the same value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PredictionError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("Prediction for {symbol} timed out after {duration_ms}ms")]
    Timeout { symbol: String, duration_ms: u64 },

    #[error("Prediction cancelled")]
    Cancelled,

    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

impl PredictionError {
    /// Short machine-readable category used in reports and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            PredictionError::Fetch(FetchError::DataUnavailable { .. }) => "data_unavailable",
            PredictionError::Fetch(FetchError::RateLimited { .. }) => "rate_limited",
            PredictionError::Fetch(FetchError::Timeout { .. }) => "fetch_timeout",
            PredictionError::Fetch(FetchError::Cancelled) => "cancelled",
            PredictionError::Aggregation(AggregationError::InvalidSnapshot { .. }) => {
                "invalid_snapshot"
            }
            PredictionError::Aggregation(AggregationError::StaleData { .. }) => "stale_data",
            PredictionError::Aggregation(AggregationError::IncompleteData { .. }) => {
                "incomplete_data"
            }
            PredictionError::Inference(InferenceError::ProviderError { .. }) => "provider_error",
            PredictionError::Inference(InferenceError::ProviderTimeout { .. }) => {
                "provider_timeout"
            }
            PredictionError::Inference(InferenceError::StreamInterrupted { .. }) => {
                "stream_interrupted"
            }
            PredictionError::Inference(InferenceError::InferenceFailed { .. }) => {
                "inference_failed"
            }
            PredictionError::Inference(InferenceError::Cancelled) => "cancelled",
            PredictionError::Timeout { .. } => "timeout",
            PredictionError::Cancelled => "cancelled",
            PredictionError::Internal { .. } => "internal",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == "cancelled"
    }

    /// The model never answered within its time limits; a later attempt may succeed
    pub fn is_inference_timeout(&self) -> bool {
        matches!(
            self,
            PredictionError::Inference(InferenceError::InferenceFailed {
                timed_out: true,
                ..
            })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display() {
        let err = FetchError::RateLimited {
            provider: "binance".to_string(),
            retry_after_ms: Some(1500),
        };
        assert_eq!(
            err.to_string(),
            "Rate limited by binance: retry after Some(1500)ms"
        );
        assert!(err.is_transient());
        assert_eq!(err.retry_after_ms(), Some(1500));
    }

    #[test]
    fn test_fetch_error_transience() {
        assert!(FetchError::Timeout { duration_ms: 10 }.is_transient());
        assert!(
            !FetchError::DataUnavailable {
                symbol: "BTC/USDT".to_string(),
                reason: "unknown".to_string()
            }
            .is_transient()
        );
        assert!(!FetchError::Cancelled.is_transient());
    }

    #[test]
    fn test_invalid_snapshot_display() {
        let err = AggregationError::InvalidSnapshot {
            symbol: "ETH/USDT".to_string(),
            timeframe: Timeframe::OneHour,
            defect: SnapshotDefect::TooShort {
                indicator: IndicatorName::Momentum,
                required: 15,
                actual: 10,
            },
        };
        assert_eq!(
            err.to_string(),
            "Invalid snapshot for ETH/USDT 1h: momentum needs 15 samples, got 10"
        );

        let err = AggregationError::InvalidSnapshot {
            symbol: "ETH/USDT".to_string(),
            timeframe: Timeframe::FourHour,
            defect: SnapshotDefect::MalformedCandle {
                index: 3,
                reason: "high below low".to_string(),
            },
        };
        assert_eq!(
            err.to_string(),
            "Invalid snapshot for ETH/USDT 4h: candle 3 is malformed: high below low"
        );
        assert_eq!(PredictionError::from(err).kind(), "invalid_snapshot");
    }

    #[test]
    fn test_prediction_error_kind() {
        let err: PredictionError = InferenceError::ProviderError {
            reason: "bad".to_string(),
        }
        .into();
        assert_eq!(err.kind(), "provider_error");

        let err: PredictionError = AggregationError::StaleData {
            symbol: "BTC/USDT".to_string(),
            age_ms: 10,
            threshold_ms: 5,
        }
        .into();
        assert_eq!(err.kind(), "stale_data");
        assert!(PredictionError::Cancelled.is_cancelled());
        assert!(PredictionError::from(FetchError::Cancelled).is_cancelled());
    }

    #[test]
    fn test_inference_timeout_classification() {
        let timed_out: PredictionError = InferenceError::InferenceFailed {
            attempts: 2,
            reason: "no answer".to_string(),
            timed_out: true,
        }
        .into();
        assert!(timed_out.is_inference_timeout());
        assert_eq!(timed_out.kind(), "inference_failed");

        let unparseable: PredictionError = InferenceError::InferenceFailed {
            attempts: 1,
            reason: "no json".to_string(),
            timed_out: false,
        }
        .into();
        assert!(!unparseable.is_inference_timeout());
        assert!(!PredictionError::from(FetchError::Timeout { duration_ms: 5 }).is_inference_timeout());
    }
}
