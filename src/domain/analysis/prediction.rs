use crate::domain::market::symbol::Symbol;
use crate::domain::market::timeframe::Timeframe;
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How much risk the generated strategy may take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskProfile {
    Conservative,
    #[default]
    Moderate,
    Aggressive,
}

impl FromStr for RiskProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "conservative" => Ok(RiskProfile::Conservative),
            "moderate" => Ok(RiskProfile::Moderate),
            "aggressive" => Ok(RiskProfile::Aggressive),
            _ => Err(anyhow!(
                "Invalid risk profile: '{}'. Must be conservative, moderate or aggressive",
                s
            )),
        }
    }
}

impl fmt::Display for RiskProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskProfile::Conservative => "conservative",
            RiskProfile::Moderate => "moderate",
            RiskProfile::Aggressive => "aggressive",
        };
        f.write_str(s)
    }
}

/// Request parameters shared by a single prediction or by every symbol of a scan.
///
/// Part of the cache key, so two requests that differ in any field never share a result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PredictionParams {
    timeframes: Vec<Timeframe>,
    pub primary_timeframe: Timeframe,
    pub risk_profile: RiskProfile,
    pub model: Option<String>,
    pub kline_limit: usize,
    pub depth_limit: usize,
}

impl Default for PredictionParams {
    fn default() -> Self {
        Self {
            timeframes: vec![Timeframe::FifteenMin, Timeframe::OneHour, Timeframe::FourHour],
            primary_timeframe: Timeframe::FourHour,
            risk_profile: RiskProfile::Moderate,
            model: None,
            kline_limit: 100,
            depth_limit: 20,
        }
    }
}

impl PredictionParams {
    /// Sets the analysed timeframes, sorted and deduplicated.
    ///
    /// The primary timeframe becomes the longest one unless it is already in the list.
    pub fn with_timeframes(mut self, timeframes: impl IntoIterator<Item = Timeframe>) -> Self {
        let mut list: Vec<Timeframe> = timeframes.into_iter().collect();
        list.sort();
        list.dedup();
        if !list.contains(&self.primary_timeframe) {
            if let Some(longest) = list.last() {
                self.primary_timeframe = *longest;
            }
        }
        self.timeframes = list;
        self
    }

    pub fn with_primary(mut self, timeframe: Timeframe) -> Self {
        self.primary_timeframe = timeframe;
        if !self.timeframes.contains(&timeframe) {
            self.timeframes.push(timeframe);
            self.timeframes.sort();
        }
        self
    }

    pub fn with_risk_profile(mut self, risk_profile: RiskProfile) -> Self {
        self.risk_profile = risk_profile;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_kline_limit(mut self, limit: usize) -> Self {
        self.kline_limit = limit;
        self
    }

    pub fn timeframes(&self) -> &[Timeframe] {
        &self.timeframes
    }

    /// Stable JSON encoding used for cache keys
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Bullish,
    Bearish,
    Neutral,
}

impl Direction {
    /// Lenient reading of free-form model output (`"Strong Bullish"`, `"bear"`, `"range"`)
    pub fn from_text(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("not bull") || lower.contains("not bear") {
            return Direction::Neutral;
        }
        if ["bull", "long", "buy"].iter().any(|k| lower.contains(k)) {
            Direction::Bullish
        } else if ["bear", "short", "sell"]
            .iter()
            .any(|k| lower.contains(k))
        {
            Direction::Bearish
        } else {
            Direction::Neutral
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSignal {
    Long,
    Short,
    Wait,
}

impl From<Direction> for TradeSignal {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Bullish => TradeSignal::Long,
            Direction::Bearish => TradeSignal::Short,
            Direction::Neutral => TradeSignal::Wait,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Extreme,
}

impl RiskLevel {
    pub fn from_text(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("extreme") || lower.contains("very high") {
            RiskLevel::Extreme
        } else if lower.contains("high") {
            RiskLevel::High
        } else if lower.contains("low") {
            RiskLevel::Low
        } else {
            RiskLevel::Medium
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceZone {
    pub low: f64,
    pub high: f64,
}

impl PriceZone {
    pub fn new(a: f64, b: f64) -> Self {
        Self {
            low: a.min(b),
            high: a.max(b),
        }
    }

    pub fn mid(&self) -> f64 {
        (self.low + self.high) / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct KeyLevels {
    pub strong_resistance: Option<f64>,
    pub weak_resistance: Option<f64>,
    pub current_price: Option<f64>,
    pub weak_support: Option<f64>,
    pub strong_support: Option<f64>,
}

/// Structured strategy extracted from a complete model response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyPlan {
    pub direction: Direction,
    pub signal: TradeSignal,
    /// 0-100
    pub confidence: u8,
    pub entry_zone: Option<PriceZone>,
    pub stop_loss: Option<f64>,
    pub take_profit: Vec<f64>,
    pub key_levels: KeyLevels,
    pub reasoning: Vec<String>,
    pub risk_level: RiskLevel,
    pub risk_notes: Vec<String>,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    Full,
    /// Stream ended early; `raw_text` holds everything received
    Partial,
}

/// Outcome of one inference over one analysis context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub symbol: Symbol,
    pub context_fingerprint: String,
    pub model: String,
    /// Unix milliseconds
    pub created_at: i64,
    pub completeness: Completeness,
    pub raw_text: String,
    pub strategy: Option<StrategyPlan>,
}

impl PredictionResult {
    pub fn is_partial(&self) -> bool {
        self.completeness == Completeness::Partial
    }
}
