use crate::domain::analysis::context::{AnalysisContext, ContextFrame, MarketView};
use crate::domain::analysis::indicators::IndicatorSet;
use crate::domain::errors::AggregationError;
use crate::domain::market::snapshot::MarketSnapshot;
use crate::domain::market::symbol::Symbol;
use crate::domain::market::timeframe::Timeframe;
use rust_decimal::prelude::ToPrimitive;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorConfig {
    pub staleness_threshold: Duration,
    /// Candles per timeframe embedded in the context
    pub recent_candles: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(120),
            recent_candles: 20,
        }
    }
}

/// Merges snapshots and indicator sets into one [`AnalysisContext`].
///
/// The merge is deterministic: identical inputs always produce the same
/// canonical payload, independent of the wall clock.
#[derive(Debug, Clone, Default)]
pub struct ContextAggregator {
    config: AggregatorConfig,
}

impl ContextAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn build(
        &self,
        symbol: &Symbol,
        timeframes: &[Timeframe],
        snapshots: Vec<MarketSnapshot>,
        indicator_sets: Vec<IndicatorSet>,
    ) -> Result<AnalysisContext, AggregationError> {
        let now = chrono::Utc::now().timestamp_millis();
        self.build_at(symbol, timeframes, snapshots, indicator_sets, now)
    }

    /// [`build`](Self::build) against an explicit clock
    pub fn build_at(
        &self,
        symbol: &Symbol,
        timeframes: &[Timeframe],
        snapshots: Vec<MarketSnapshot>,
        indicator_sets: Vec<IndicatorSet>,
        now_ms: i64,
    ) -> Result<AnalysisContext, AggregationError> {
        let incomplete = |reason: String| AggregationError::IncompleteData {
            symbol: symbol.to_string(),
            reason,
        };

        if snapshots.is_empty() {
            return Err(incomplete("no snapshots".to_string()));
        }
        if let Some(other) = snapshots.iter().find(|s| s.symbol() != symbol) {
            return Err(incomplete(format!("snapshot belongs to {}", other.symbol())));
        }
        if let Some(other) = indicator_sets.iter().find(|s| &s.symbol != symbol) {
            return Err(incomplete(format!("indicator set belongs to {}", other.symbol)));
        }

        let threshold_ms = self.config.staleness_threshold.as_millis() as u64;
        for snapshot in &snapshots {
            let age_ms = snapshot.age_ms(now_ms);
            if age_ms > threshold_ms {
                return Err(AggregationError::StaleData {
                    symbol: symbol.to_string(),
                    age_ms,
                    threshold_ms,
                });
            }
        }

        let mut timeframes = timeframes.to_vec();
        timeframes.sort();
        timeframes.dedup();
        if timeframes.is_empty() {
            return Err(incomplete("no timeframes requested".to_string()));
        }

        let mut frames = Vec::with_capacity(timeframes.len());
        for tf in &timeframes {
            let source = freshest(snapshots.iter().filter(|s| s.series(*tf).is_some()))
                .ok_or_else(|| incomplete(format!("no {} series", tf)))?;
            let candles = source.series(*tf).unwrap_or_default();

            // a later set for the same timeframe replaces an earlier one
            let indicators = indicator_sets
                .iter()
                .rev()
                .find(|set| set.timeframe == *tf)
                .cloned()
                .ok_or_else(|| incomplete(format!("no {} indicators", tf)))?;

            let skip = candles.len().saturating_sub(self.config.recent_candles);
            frames.push(ContextFrame {
                timeframe: *tf,
                fetched_at: source.fetched_at(),
                recent_candles: candles[skip..].to_vec(),
                indicators,
            });
        }

        let newest = freshest(snapshots.iter())
            .ok_or_else(|| incomplete("no snapshots".to_string()))?;
        let market = MarketView {
            last_price: newest
                .last_price()
                .and_then(|p| p.to_f64())
                .unwrap_or_default(),
            order_book: newest.order_book().summary(),
            ticker: newest.ticker().cloned(),
        };

        let context = AnalysisContext::new(symbol.clone(), snapshots, frames, market, now_ms);
        debug!(
            "ContextAggregator: Built context for {} over {} timeframes (fingerprint {})",
            symbol,
            timeframes.len(),
            &context.fingerprint()[..12]
        );
        Ok(context)
    }
}

/// Largest `fetched_at`; ties keep the earliest in iteration order
fn freshest<'a>(snapshots: impl Iterator<Item = &'a MarketSnapshot>) -> Option<&'a MarketSnapshot> {
    snapshots.fold(None, |best, s| match best {
        Some(b) if b.fetched_at() >= s.fetched_at() => Some(b),
        _ => Some(s),
    })
}
