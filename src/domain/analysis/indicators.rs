use crate::domain::market::symbol::Symbol;
use crate::domain::market::timeframe::Timeframe;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Every indicator the engine produces.
///
/// Declaration order is the canonical ordering inside an [`IndicatorSet`]
/// and the order in which minimum-window checks are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorName {
    SmaFast,
    SmaSlow,
    EmaFast,
    EmaSlow,
    Rsi,
    Macd,
    MacdSignal,
    MacdHistogram,
    BbUpper,
    BbMiddle,
    BbLower,
    BbWidth,
    Atr,
    Adx,
    Momentum,
    Volatility,
}

impl IndicatorName {
    pub fn all() -> &'static [IndicatorName] {
        use IndicatorName::*;
        &[
            SmaFast,
            SmaSlow,
            EmaFast,
            EmaSlow,
            Rsi,
            Macd,
            MacdSignal,
            MacdHistogram,
            BbUpper,
            BbMiddle,
            BbLower,
            BbWidth,
            Atr,
            Adx,
            Momentum,
            Volatility,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        use IndicatorName::*;
        match self {
            SmaFast => "sma_fast",
            SmaSlow => "sma_slow",
            EmaFast => "ema_fast",
            EmaSlow => "ema_slow",
            Rsi => "rsi",
            Macd => "macd",
            MacdSignal => "macd_signal",
            MacdHistogram => "macd_histogram",
            BbUpper => "bb_upper",
            BbMiddle => "bb_middle",
            BbLower => "bb_lower",
            BbWidth => "bb_width",
            Atr => "atr",
            Adx => "adx",
            Momentum => "momentum",
            Volatility => "volatility",
        }
    }

    /// Smallest series length for which the indicator has a defined last value
    pub fn min_samples(&self) -> usize {
        use IndicatorName::*;
        match self {
            SmaFast => 20,
            SmaSlow => 50,
            EmaFast | EmaSlow => 26,
            Rsi => 15,
            Macd | MacdSignal | MacdHistogram => 34,
            BbUpper | BbMiddle | BbLower | BbWidth => 20,
            Atr => 15,
            Adx => 28,
            Momentum => 15,
            Volatility => 21,
        }
    }
}

impl fmt::Display for IndicatorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendBias {
    Bullish,
    Bearish,
    Neutral,
}

impl TrendBias {
    /// Moving-average stack: close > fast > slow is bullish, the mirror is bearish
    pub fn from_stack(close: f64, sma_fast: f64, sma_slow: f64) -> Self {
        if close > sma_fast && sma_fast > sma_slow {
            TrendBias::Bullish
        } else if close < sma_fast && sma_fast < sma_slow {
            TrendBias::Bearish
        } else {
            TrendBias::Neutral
        }
    }
}

/// Indicator values for one symbol and timeframe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub last_close: f64,
    pub trend: TrendBias,
    pub values: BTreeMap<IndicatorName, f64>,
}

impl IndicatorSet {
    pub fn get(&self, name: IndicatorName) -> Option<f64> {
        self.values.get(&name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_is_declaration_order() {
        let mut sorted = IndicatorName::all().to_vec();
        sorted.sort();
        assert_eq!(sorted, IndicatorName::all());
    }

    #[test]
    fn test_min_samples_max_is_slow_sma() {
        let max = IndicatorName::all()
            .iter()
            .map(IndicatorName::min_samples)
            .max();
        assert_eq!(max, Some(50));
    }

    #[test]
    fn test_trend_bias_from_stack() {
        assert_eq!(TrendBias::from_stack(110.0, 105.0, 100.0), TrendBias::Bullish);
        assert_eq!(TrendBias::from_stack(90.0, 95.0, 100.0), TrendBias::Bearish);
        assert_eq!(TrendBias::from_stack(101.0, 105.0, 100.0), TrendBias::Neutral);
    }

    #[test]
    fn test_serialized_names_are_snake_case() {
        let json = serde_json::to_string(&IndicatorName::MacdHistogram).unwrap();
        assert_eq!(json, "\"macd_histogram\"");
        assert_eq!(IndicatorName::BbWidth.to_string(), "bb_width");
    }
}
