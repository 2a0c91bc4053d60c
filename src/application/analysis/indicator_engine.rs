//! Deterministic technical indicators over one snapshot series.
//!
//! All arithmetic is `f64`, inputs are consumed oldest to newest and only the
//! last value of each indicator is reported. Windows are fixed:
//!
//! | indicator | window | method |
//! |---|---|---|
//! | `sma_fast` / `sma_slow` | 20 / 50 | simple mean of closes |
//! | `ema_fast` / `ema_slow` | 12 / 26 | EMA, k = 2/(n+1), seeded with the first close |
//! | `rsi` | 14 | EMA-smoothed gains over losses |
//! | `macd` / `macd_signal` / `macd_histogram` | 12 / 26 / 9 | EMA difference and its EMA |
//! | `bb_*` | 20, 2σ | population σ; width = (upper - lower) / middle |
//! | `atr` | 14 | EMA-smoothed true range |
//! | `adx` | 14 | Wilder smoothing seeded with the sum of the first 14 values |
//! | `momentum` | 14 | rate of change in percent |
//! | `volatility` | 20 | sample σ of log returns, in percent |
//!
//! A series shorter than an indicator's minimum window is rejected rather than
//! padded; see [`IndicatorName::min_samples`].

use crate::domain::analysis::indicators::{IndicatorName, IndicatorSet, TrendBias};
use crate::domain::errors::{AggregationError, SnapshotDefect};
use crate::domain::market::snapshot::{Candle, MarketSnapshot};
use crate::domain::market::timeframe::Timeframe;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use statrs::statistics::{Data, Distribution};
use std::collections::BTreeMap;
use ta::indicators::{
    AverageTrueRange, BollingerBands, ExponentialMovingAverage, MovingAverageConvergenceDivergence,
    RelativeStrengthIndex, SimpleMovingAverage,
};
use ta::{Close, DataItem, High, Low, Next};

const SMA_FAST: usize = 20;
const SMA_SLOW: usize = 50;
const EMA_FAST: usize = 12;
const EMA_SLOW: usize = 26;
const RSI_PERIOD: usize = 14;
const MACD_SIGNAL: usize = 9;
const BB_PERIOD: usize = 20;
const BB_MULTIPLIER: f64 = 2.0;
const ATR_PERIOD: usize = 14;
const ADX_PERIOD: usize = 14;
const MOMENTUM_PERIOD: usize = 14;
const VOLATILITY_WINDOW: usize = 20;

/// Wilder ADX: the first `period` directional movements are summed, later
/// values are smoothed as `prev - prev / n + x`.
struct WilderAdx {
    period: usize,
    prev: Option<(f64, f64, f64)>,
    count: usize,
    tr: f64,
    plus_dm: f64,
    minus_dm: f64,
    adx: f64,
}

impl WilderAdx {
    fn new(period: usize) -> Self {
        Self {
            period,
            prev: None,
            count: 0,
            tr: 0.0,
            plus_dm: 0.0,
            minus_dm: 0.0,
            adx: 0.0,
        }
    }

    fn next(&mut self, high: f64, low: f64, close: f64) -> f64 {
        let Some((prev_high, prev_low, prev_close)) = self.prev.replace((high, low, close)) else {
            return 0.0;
        };

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        let up = high - prev_high;
        let down = prev_low - low;
        let plus_dm = if up > down && up > 0.0 { up } else { 0.0 };
        let minus_dm = if down > up && down > 0.0 { down } else { 0.0 };

        self.count += 1;
        let n = self.period as f64;
        if self.count <= self.period {
            self.tr += tr;
            self.plus_dm += plus_dm;
            self.minus_dm += minus_dm;
        } else {
            self.tr = self.tr - self.tr / n + tr;
            self.plus_dm = self.plus_dm - self.plus_dm / n + plus_dm;
            self.minus_dm = self.minus_dm - self.minus_dm / n + minus_dm;
        }

        if self.count < self.period || self.tr <= 0.0 {
            return self.adx;
        }

        let plus_di = 100.0 * self.plus_dm / self.tr;
        let minus_di = 100.0 * self.minus_dm / self.tr;
        let di_sum = plus_di + minus_di;
        let dx = if di_sum > 0.0 {
            100.0 * (plus_di - minus_di).abs() / di_sum
        } else {
            0.0
        };

        self.adx = if self.count == self.period {
            dx
        } else {
            (self.adx * (n - 1.0) + dx) / n
        };
        self.adx
    }
}

/// Stateless indicator calculator.
///
/// Holds pristine indicator prototypes that are cloned for every computation,
/// so the same series always produces the same values.
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    sma_fast: SimpleMovingAverage,
    sma_slow: SimpleMovingAverage,
    ema_fast: ExponentialMovingAverage,
    ema_slow: ExponentialMovingAverage,
    rsi: RelativeStrengthIndex,
    macd: MovingAverageConvergenceDivergence,
    bb: BollingerBands,
    atr: AverageTrueRange,
}

impl IndicatorEngine {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            sma_fast: SimpleMovingAverage::new(SMA_FAST)?,
            sma_slow: SimpleMovingAverage::new(SMA_SLOW)?,
            ema_fast: ExponentialMovingAverage::new(EMA_FAST)?,
            ema_slow: ExponentialMovingAverage::new(EMA_SLOW)?,
            rsi: RelativeStrengthIndex::new(RSI_PERIOD)?,
            macd: MovingAverageConvergenceDivergence::new(EMA_FAST, EMA_SLOW, MACD_SIGNAL)?,
            bb: BollingerBands::new(BB_PERIOD, BB_MULTIPLIER)?,
            atr: AverageTrueRange::new(ATR_PERIOD)?,
        })
    }

    /// Shortest series every indicator can be computed on
    pub fn min_series_len() -> usize {
        IndicatorName::all()
            .iter()
            .map(IndicatorName::min_samples)
            .max()
            .unwrap_or(SMA_SLOW)
    }

    /// Indicator set for one timeframe of `snapshot`
    pub fn compute(
        &self,
        snapshot: &MarketSnapshot,
        timeframe: Timeframe,
    ) -> Result<IndicatorSet, AggregationError> {
        let symbol = snapshot.symbol();
        let candles = snapshot
            .series(timeframe)
            .ok_or_else(|| AggregationError::IncompleteData {
                symbol: symbol.to_string(),
                reason: format!("snapshot has no {} series", timeframe),
            })?;

        let bars = to_bars(candles).map_err(|(index, reason)| {
            AggregationError::InvalidSnapshot {
                symbol: symbol.to_string(),
                timeframe,
                defect: SnapshotDefect::MalformedCandle { index, reason },
            }
        })?;

        if let Some(short) = IndicatorName::all()
            .iter()
            .find(|name| bars.len() < name.min_samples())
        {
            return Err(AggregationError::InvalidSnapshot {
                symbol: symbol.to_string(),
                timeframe,
                defect: SnapshotDefect::TooShort {
                    indicator: *short,
                    required: short.min_samples(),
                    actual: bars.len(),
                },
            });
        }

        let values = self.evaluate(&bars);

        if let Some((name, _)) = values.iter().find(|(_, v)| !v.is_finite()) {
            return Err(AggregationError::InvalidSnapshot {
                symbol: symbol.to_string(),
                timeframe,
                defect: SnapshotDefect::MalformedCandle {
                    index: bars.len() - 1,
                    reason: format!("{} is not finite", name),
                },
            });
        }

        let last_close = bars[bars.len() - 1].close();
        let stack = |name| values.get(&name).copied().unwrap_or(last_close);
        let trend = TrendBias::from_stack(
            last_close,
            stack(IndicatorName::SmaFast),
            stack(IndicatorName::SmaSlow),
        );

        Ok(IndicatorSet {
            symbol: symbol.clone(),
            timeframe,
            last_close,
            trend,
            values,
        })
    }

    /// One set per timeframe in the snapshot, shortest timeframe first
    pub fn compute_all(
        &self,
        snapshot: &MarketSnapshot,
    ) -> Result<Vec<IndicatorSet>, AggregationError> {
        snapshot
            .timeframes()
            .map(|tf| self.compute(snapshot, tf))
            .collect()
    }

    fn evaluate(&self, bars: &[DataItem]) -> BTreeMap<IndicatorName, f64> {
        let mut sma_fast = self.sma_fast.clone();
        let mut sma_slow = self.sma_slow.clone();
        let mut ema_fast = self.ema_fast.clone();
        let mut ema_slow = self.ema_slow.clone();
        let mut rsi = self.rsi.clone();
        let mut macd = self.macd.clone();
        let mut bb = self.bb.clone();
        let mut atr = self.atr.clone();
        let mut adx = WilderAdx::new(ADX_PERIOD);

        let mut values = BTreeMap::new();
        for bar in bars {
            let close = bar.close();

            let macd_out = macd.next(close);
            let bb_out = bb.next(close);
            values.insert(IndicatorName::SmaFast, sma_fast.next(close));
            values.insert(IndicatorName::SmaSlow, sma_slow.next(close));
            values.insert(IndicatorName::EmaFast, ema_fast.next(close));
            values.insert(IndicatorName::EmaSlow, ema_slow.next(close));
            values.insert(IndicatorName::Rsi, rsi.next(close));
            values.insert(IndicatorName::Macd, macd_out.macd);
            values.insert(IndicatorName::MacdSignal, macd_out.signal);
            values.insert(IndicatorName::MacdHistogram, macd_out.histogram);
            values.insert(IndicatorName::BbUpper, bb_out.upper);
            values.insert(IndicatorName::BbMiddle, bb_out.average);
            values.insert(IndicatorName::BbLower, bb_out.lower);
            values.insert(
                IndicatorName::BbWidth,
                (bb_out.upper - bb_out.lower) / bb_out.average,
            );
            values.insert(IndicatorName::Atr, atr.next(bar));
            values.insert(IndicatorName::Adx, adx.next(bar.high(), bar.low(), close));
        }

        let closes: Vec<f64> = bars.iter().map(|b| b.close()).collect();
        values.insert(IndicatorName::Momentum, rate_of_change(&closes, MOMENTUM_PERIOD));
        values.insert(
            IndicatorName::Volatility,
            log_return_volatility(&closes, VOLATILITY_WINDOW),
        );

        values
    }
}

fn decimal(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}

fn to_bars(candles: &[Candle]) -> Result<Vec<DataItem>, (usize, String)> {
    candles
        .iter()
        .enumerate()
        .map(|(index, c)| {
            let (open, high, low, close) =
                (decimal(c.open), decimal(c.high), decimal(c.low), decimal(c.close));
            if [open, high, low, close].iter().any(|p| !p.is_finite() || *p <= 0.0) {
                return Err((index, "prices must be positive".to_string()));
            }
            if high < low {
                return Err((index, format!("high {} below low {}", high, low)));
            }
            DataItem::builder()
                .open(open)
                .high(high)
                .low(low)
                .close(close)
                .volume(decimal(c.volume).max(0.0))
                .build()
                .map_err(|e| (index, format!("{:?}", e)))
        })
        .collect()
}

/// `(close / close[n bars ago] - 1) * 100`
fn rate_of_change(closes: &[f64], period: usize) -> f64 {
    let last = closes[closes.len() - 1];
    let base = closes[closes.len() - 1 - period];
    (last / base - 1.0) * 100.0
}

/// Sample standard deviation of the last `window` log returns, in percent
fn log_return_volatility(closes: &[f64], window: usize) -> f64 {
    let tail = &closes[closes.len() - window - 1..];
    let returns: Vec<f64> = tail.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
    Data::new(returns).std_dev().unwrap_or(0.0) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::snapshot::OrderBook;
    use crate::domain::market::symbol::Symbol;

    fn candle(i: usize, close: f64) -> Candle {
        let close = Decimal::from_f64_retain(close).unwrap();
        let spread = Decimal::from_f64_retain(0.5).unwrap();
        Candle {
            timestamp: i as i64 * 3_600_000,
            open: close,
            high: close + spread,
            low: close - spread,
            close,
            volume: Decimal::from(10),
        }
    }

    fn snapshot_with(closes: &[f64]) -> MarketSnapshot {
        let candles = closes
            .iter()
            .enumerate()
            .map(|(i, c)| candle(i, *c))
            .collect();
        let mut series = BTreeMap::new();
        series.insert(Timeframe::OneHour, candles);
        MarketSnapshot::new(
            Symbol::parse("BTCUSDT").unwrap(),
            0,
            series,
            OrderBook::default(),
            None,
        )
    }

    fn rising(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64).collect()
    }

    #[test]
    fn test_min_series_len() {
        assert_eq!(IndicatorEngine::min_series_len(), 50);
    }

    #[test]
    fn test_short_series_is_invalid() {
        let engine = IndicatorEngine::new().unwrap();
        let err = engine
            .compute(&snapshot_with(&rising(30)), Timeframe::OneHour)
            .unwrap_err();
        match err {
            AggregationError::InvalidSnapshot {
                defect:
                    SnapshotDefect::TooShort {
                        indicator,
                        required,
                        actual,
                    },
                ..
            } => {
                assert_eq!(indicator, IndicatorName::SmaSlow);
                assert_eq!(required, 50);
                assert_eq!(actual, 30);
            }
            other => panic!("unexpected error {:?}", other),
        }

        let err = engine
            .compute(&snapshot_with(&rising(10)), Timeframe::OneHour)
            .unwrap_err();
        assert!(matches!(
            err,
            AggregationError::InvalidSnapshot {
                defect: SnapshotDefect::TooShort {
                    indicator: IndicatorName::SmaFast,
                    ..
                },
                ..
            }
        ));
    }

    #[test]
    fn test_missing_timeframe_is_incomplete() {
        let engine = IndicatorEngine::new().unwrap();
        let err = engine
            .compute(&snapshot_with(&rising(60)), Timeframe::OneDay)
            .unwrap_err();
        assert!(matches!(err, AggregationError::IncompleteData { .. }));
    }

    #[test]
    fn test_rising_series_values() {
        let engine = IndicatorEngine::new().unwrap();
        let closes = rising(60);
        let set = engine
            .compute(&snapshot_with(&closes), Timeframe::OneHour)
            .unwrap();

        // mean of 140..=159
        assert!((set.get(IndicatorName::SmaFast).unwrap() - 149.5).abs() < 1e-9);
        // mean of 110..=159
        assert!((set.get(IndicatorName::SmaSlow).unwrap() - 134.5).abs() < 1e-9);
        // 159 / 145 - 1
        let expected_roc = (159.0 / 145.0 - 1.0) * 100.0;
        assert!((set.get(IndicatorName::Momentum).unwrap() - expected_roc).abs() < 1e-9);
        assert!(set.get(IndicatorName::Rsi).unwrap() > 90.0);
        assert!(set.get(IndicatorName::Macd).unwrap() > 0.0);
        assert!(set.get(IndicatorName::Adx).unwrap() > 50.0);
        assert_eq!(set.trend, TrendBias::Bullish);
        assert_eq!(set.last_close, 159.0);
        assert_eq!(set.values.len(), IndicatorName::all().len());
    }

    #[test]
    fn test_flat_series_has_zero_volatility() {
        let engine = IndicatorEngine::new().unwrap();
        let set = engine
            .compute(&snapshot_with(&vec![100.0; 60]), Timeframe::OneHour)
            .unwrap();
        assert_eq!(set.get(IndicatorName::Volatility), Some(0.0));
        assert_eq!(set.get(IndicatorName::Momentum), Some(0.0));
        assert_eq!(set.trend, TrendBias::Neutral);
    }

    #[test]
    fn test_compute_is_deterministic() {
        let engine = IndicatorEngine::new().unwrap();
        let closes: Vec<f64> = (0..80)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0)
            .collect();
        let snapshot = snapshot_with(&closes);

        let a = engine.compute(&snapshot, Timeframe::OneHour).unwrap();
        let b = engine.compute(&snapshot, Timeframe::OneHour).unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_malformed_candle_rejected() {
        let engine = IndicatorEngine::new().unwrap();
        let mut closes = rising(60);
        closes[7] = -1.0;
        let err = engine
            .compute(&snapshot_with(&closes), Timeframe::OneHour)
            .unwrap_err();
        assert!(matches!(
            err,
            AggregationError::InvalidSnapshot {
                defect: SnapshotDefect::MalformedCandle { index: 7, .. },
                ..
            }
        ));
    }
}
