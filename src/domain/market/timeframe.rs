use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Candle interval used for market data analysis.
///
/// Variants are declared from shortest to longest so the derived ordering
/// is the canonical ordering used everywhere a context is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    OneMin,
    #[serde(rename = "5m")]
    FiveMin,
    #[serde(rename = "15m")]
    FifteenMin,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHour,
    #[serde(rename = "1d")]
    OneDay,
}

impl Timeframe {
    /// Every supported interval, shortest first
    pub const ALL: [Timeframe; 6] = [
        Timeframe::OneMin,
        Timeframe::FiveMin,
        Timeframe::FifteenMin,
        Timeframe::OneHour,
        Timeframe::FourHour,
        Timeframe::OneDay,
    ];

    pub fn to_secs(&self) -> i64 {
        const MINUTE: i64 = 60;
        const HOUR: i64 = 60 * MINUTE;
        match self {
            Timeframe::OneMin => MINUTE,
            Timeframe::FiveMin => 5 * MINUTE,
            Timeframe::FifteenMin => 15 * MINUTE,
            Timeframe::OneHour => HOUR,
            Timeframe::FourHour => 4 * HOUR,
            Timeframe::OneDay => 24 * HOUR,
        }
    }

    pub fn to_millis(&self) -> i64 {
        self.to_secs() * 1000
    }

    /// Exchange interval string (`1m`, `4h`, ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneMin => "1m",
            Timeframe::FiveMin => "5m",
            Timeframe::FifteenMin => "15m",
            Timeframe::OneHour => "1h",
            Timeframe::FourHour => "4h",
            Timeframe::OneDay => "1d",
        }
    }

    /// Open time (ms) of the bar containing `timestamp_ms`
    pub fn period_start(&self, timestamp_ms: i64) -> i64 {
        let period = self.to_millis();
        timestamp_ms - timestamp_ms.rem_euclid(period)
    }

    /// Parses a comma separated list (`"15m,1h,4h"`), sorted and deduplicated
    pub fn parse_list(s: &str) -> Result<Vec<Timeframe>> {
        let mut list = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Timeframe::from_str)
            .collect::<Result<Vec<_>>>()?;
        list.sort();
        list.dedup();
        if list.is_empty() {
            return Err(anyhow!("Timeframe list '{}' is empty", s));
        }
        Ok(list)
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    /// Accepts exchange intervals (`4h`) and spelled-out units (`4hour`, `15min`)
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        let normalized = lower
            .strip_suffix("min")
            .map(|n| format!("{}m", n))
            .or_else(|| lower.strip_suffix("hour").map(|n| format!("{}h", n)))
            .or_else(|| lower.strip_suffix("day").map(|n| format!("{}d", n)))
            .unwrap_or(lower);

        Timeframe::ALL
            .into_iter()
            .find(|tf| tf.as_str() == normalized)
            .ok_or_else(|| {
                anyhow!(
                    "Invalid timeframe: '{}'. Valid options: 1m, 5m, 15m, 1h, 4h, 1d",
                    s
                )
            })
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
