use crate::domain::market::symbol::Symbol;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::info;

const HISTORY_CAP: usize = 1000;
const MIN_TICKS: usize = 5;
const COOLDOWN_MS: i64 = 60_000;
const VOLUME_SPIKE_FACTOR: f64 = 5.0;
const VOLUME_MIN_SAMPLES: usize = 10;

/// (lookback, label, fractional move threshold)
const CHECKPOINTS: [(i64, &str, f64); 4] = [
    (30_000, "30s", 0.005),
    (60_000, "1m", 0.01),
    (180_000, "3m", 0.02),
    (300_000, "5m", 0.03),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Pump,
    Dump,
    VolumeSpike,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketAlert {
    pub symbol: Symbol,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    /// Signed move in percent; zero for volume spikes
    pub change_percent: f64,
    pub window: String,
    /// Unix milliseconds
    pub timestamp: i64,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
struct Tick {
    at: i64,
    price: f64,
    volume: f64,
}

/// Detects sudden pumps, dumps and volume spikes from a stream of price ticks.
///
/// Moves are measured against the oldest tick inside each lookback window. A
/// repeat alert in the same direction is suppressed for a minute, a reversal
/// is reported at once.
#[derive(Debug)]
pub struct VolatilityMonitor {
    window_ms: i64,
    history: HashMap<Symbol, VecDeque<Tick>>,
    last_alert: HashMap<Symbol, (i64, AlertKind)>,
}

impl Default for VolatilityMonitor {
    fn default() -> Self {
        Self::new(300_000)
    }
}

impl VolatilityMonitor {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            history: HashMap::new(),
            last_alert: HashMap::new(),
        }
    }

    /// Records a tick. `volume` is the amount traded since the previous tick.
    pub fn add_tick(&mut self, symbol: &Symbol, price: f64, volume: f64, at_ms: i64) {
        if !(price.is_finite() && price > 0.0) {
            return;
        }
        let window = self.window_ms;
        let ticks = self.history.entry(symbol.clone()).or_default();
        ticks.push_back(Tick {
            at: at_ms,
            price,
            volume: volume.max(0.0),
        });
        while ticks.len() > HISTORY_CAP {
            ticks.pop_front();
        }
        while ticks.front().is_some_and(|t| at_ms - t.at > window) {
            ticks.pop_front();
        }
    }

    pub fn history_len(&self, symbol: &Symbol) -> usize {
        self.history.get(symbol).map_or(0, VecDeque::len)
    }

    pub fn check(&mut self, symbol: &Symbol) -> Option<MarketAlert> {
        let ticks = self.history.get(symbol)?;
        if ticks.len() < MIN_TICKS {
            return None;
        }
        let current = *ticks.back()?;
        let (last_at, last_kind) = self
            .last_alert
            .get(symbol)
            .copied()
            .unwrap_or((i64::MIN / 2, AlertKind::VolumeSpike));
        let since_last = current.at - last_at;

        for (lookback, label, threshold) in CHECKPOINTS {
            let target = current.at - lookback;
            let Some(reference) = ticks.iter().find(|t| t.at >= target) else {
                continue;
            };
            // the window must be at least half covered
            if current.at - reference.at < lookback / 2 {
                continue;
            }

            let change = (current.price - reference.price) / reference.price;
            if change.abs() < threshold {
                continue;
            }

            let kind = if change > 0.0 {
                AlertKind::Pump
            } else {
                AlertKind::Dump
            };
            let reversal = matches!(
                (last_kind, kind),
                (AlertKind::Pump, AlertKind::Dump) | (AlertKind::Dump, AlertKind::Pump)
            );
            if !reversal && since_last < COOLDOWN_MS {
                continue;
            }

            let severity = if change.abs() >= threshold * 2.0 {
                AlertSeverity::High
            } else if change.abs() >= threshold * 1.5 {
                AlertSeverity::Medium
            } else {
                AlertSeverity::Low
            };
            let direction = if kind == AlertKind::Pump { "PUMP" } else { "DUMP" };
            let alert = MarketAlert {
                symbol: symbol.clone(),
                kind,
                severity,
                change_percent: change * 100.0,
                window: label.to_string(),
                timestamp: current.at,
                message: format!("{} {}! {:+.2}% in {}", symbol, direction, change * 100.0, label),
            };
            info!("VolatilityMonitor: {}", alert.message);
            self.last_alert.insert(symbol.clone(), (current.at, kind));
            return Some(alert);
        }

        if current.volume > 0.0 && since_last > COOLDOWN_MS {
            let past: Vec<f64> = ticks.iter().rev().skip(1).map(|t| t.volume).collect();
            if past.len() > VOLUME_MIN_SAMPLES {
                let average = past.iter().sum::<f64>() / past.len() as f64;
                if average > 0.0 && current.volume > average * VOLUME_SPIKE_FACTOR {
                    let alert = MarketAlert {
                        symbol: symbol.clone(),
                        kind: AlertKind::VolumeSpike,
                        severity: AlertSeverity::Low,
                        change_percent: 0.0,
                        window: "tick".to_string(),
                        timestamp: current.at,
                        message: format!(
                            "{} volume spike: {:.0}x the recent average",
                            symbol,
                            current.volume / average
                        ),
                    };
                    info!("VolatilityMonitor: {}", alert.message);
                    self.last_alert
                        .insert(symbol.clone(), (current.at, AlertKind::VolumeSpike));
                    return Some(alert);
                }
            }
        }

        None
    }
}
