use crate::domain::analysis::prediction::{
    Direction, KeyLevels, PriceZone, StrategyPlan, TradeSignal,
};
use tracing::{debug, warn};

/// Entries may sit this far past the current price before they count as chasing
const CHASE_TOLERANCE: f64 = 0.0005;
const MIN_REWARD_RISK: f64 = 1.0;
const ATR_STOP_MULTIPLIER: f64 = 1.5;
const FALLBACK_STOP_PCT: f64 = 0.02;
const DEFAULT_TARGETS_PCT: [f64; 3] = [0.02, 0.04, 0.06];

/// Post-parse sanity pass over a model-produced strategy.
///
/// Price levels win over prose: when the take-profit side contradicts the
/// stated direction the plan is downgraded to WAIT. Directional plans get
/// stop, target and entry placement repaired around the live price, and a
/// plan whose first target pays less than its risk is downgraded as well.
#[derive(Debug, Clone, Copy)]
pub struct StrategyGuard {
    current_price: f64,
    atr: Option<f64>,
}

impl StrategyGuard {
    pub fn new(current_price: f64, atr: Option<f64>) -> Self {
        Self {
            current_price,
            atr: atr.filter(|a| a.is_finite() && *a > 0.0),
        }
    }

    pub fn apply(&self, mut plan: StrategyPlan) -> StrategyPlan {
        let price = self.current_price;
        if !(price.is_finite() && price > 0.0) {
            return plan;
        }

        let mut entry = plan.entry_zone.unwrap_or(PriceZone::new(price, price));
        plan.direction = self.resolve_direction(&mut plan, entry.mid());

        match plan.direction {
            Direction::Bullish if entry.high > price * (1.0 + CHASE_TOLERANCE) => {
                warn!(
                    "StrategyGuard: Long entry {:.4} above price {:.4}, pulling down",
                    entry.high, price
                );
                entry.high = price;
                if entry.low > entry.high {
                    entry.low = entry.high * 0.995;
                }
            }
            Direction::Bearish if entry.low < price * (1.0 - CHASE_TOLERANCE) => {
                warn!(
                    "StrategyGuard: Short entry {:.4} below price {:.4}, pushing up",
                    entry.low, price
                );
                entry.low = price;
                if entry.high < entry.low {
                    entry.high = entry.low * 1.005;
                }
            }
            _ => {}
        }
        plan.entry_zone = Some(entry);

        if plan.direction != Direction::Neutral {
            self.repair_levels(&mut plan, entry);
            self.check_reward_risk(&mut plan, entry);
        }

        if let Some(&tp1) = plan.take_profit.first() {
            let reached = match plan.direction {
                Direction::Bullish => price >= tp1,
                Direction::Bearish => price <= tp1,
                Direction::Neutral => false,
            };
            if reached {
                plan.reasoning.insert(
                    0,
                    format!(
                        "Price {} already reached the first target {}; wait for a pullback",
                        price, tp1
                    ),
                );
            }
        }

        plan.key_levels = self.anchor_key_levels(plan.key_levels);
        plan.signal = TradeSignal::from(plan.direction);
        plan.confidence = plan.confidence.min(100);
        plan
    }

    fn resolve_direction(&self, plan: &mut StrategyPlan, entry_mid: f64) -> Direction {
        let by_price = match plan.take_profit.first() {
            Some(&tp) if tp > entry_mid => Some(Direction::Bullish),
            Some(&tp) if tp < entry_mid => Some(Direction::Bearish),
            _ => None,
        };

        match (by_price, plan.direction) {
            (None, stated) => stated,
            (Some(priced), Direction::Neutral) => priced,
            (Some(priced), stated) if priced == stated => priced,
            (Some(priced), stated) => {
                warn!(
                    "StrategyGuard: Stated {:?} contradicts first target {:?}, downgrading to WAIT",
                    stated,
                    plan.take_profit.first()
                );
                plan.reasoning.insert(
                    0,
                    format!(
                        "Direction conflict: text says {:?} but targets imply {:?}; downgraded to WAIT",
                        stated, priced
                    ),
                );
                plan.risk_notes
                    .insert(0, "Direction conflict triggered an automatic downgrade".to_string());
                Direction::Neutral
            }
        }
    }

    fn repair_levels(&self, plan: &mut StrategyPlan, entry: PriceZone) {
        let mid = entry.mid();
        let long = plan.direction == Direction::Bullish;
        let atr_stop = self.atr.map(|a| a * ATR_STOP_MULTIPLIER);

        let stop_ok = match (plan.stop_loss, long) {
            (Some(sl), true) => sl < entry.low,
            (Some(sl), false) => sl > entry.high,
            (None, _) => false,
        };
        if !stop_ok {
            let repaired = if long {
                atr_stop.map_or(entry.low * (1.0 - FALLBACK_STOP_PCT), |d| entry.low - d)
            } else {
                atr_stop.map_or(entry.high * (1.0 + FALLBACK_STOP_PCT), |d| entry.high + d)
            };
            debug!(
                "StrategyGuard: Stop {:?} on wrong side of entry, set to {:.4}",
                plan.stop_loss, repaired
            );
            plan.stop_loss = Some(repaired);
        }

        let valid: Vec<f64> = plan
            .take_profit
            .iter()
            .copied()
            .filter(|tp| if long { *tp > entry.high } else { *tp < entry.low })
            .collect();
        plan.take_profit = if valid.is_empty() {
            debug!("StrategyGuard: No usable targets, using defaults");
            DEFAULT_TARGETS_PCT
                .iter()
                .map(|pct| if long { mid * (1.0 + pct) } else { mid * (1.0 - pct) })
                .collect()
        } else {
            valid
        };
    }

    fn check_reward_risk(&self, plan: &mut StrategyPlan, entry: PriceZone) {
        let (Some(sl), Some(&tp1)) = (plan.stop_loss, plan.take_profit.first()) else {
            return;
        };
        let mid = entry.mid();
        let risk = (mid - sl).abs();
        if risk <= 0.0 {
            return;
        }
        let ratio = (tp1 - mid).abs() / risk;
        if ratio < MIN_REWARD_RISK {
            warn!(
                "StrategyGuard: Reward/risk {:.2} below {:.1}, downgrading to WAIT",
                ratio, MIN_REWARD_RISK
            );
            plan.direction = Direction::Neutral;
            plan.reasoning
                .insert(0, format!("Reward/risk too low ({:.2}); wait", ratio));
        }
    }

    fn anchor_key_levels(&self, mut levels: KeyLevels) -> KeyLevels {
        let price = self.current_price;
        levels.current_price = Some(price);

        let below = |level: Option<f64>, fallback: f64| match level {
            Some(l) if l >= price => Some(price * fallback),
            other => other,
        };
        let above = |level: Option<f64>, fallback: f64| match level {
            Some(l) if l <= price => Some(price * fallback),
            other => other,
        };

        levels.strong_support = below(levels.strong_support, 0.95);
        levels.weak_support = below(levels.weak_support, 0.98);
        levels.strong_resistance = above(levels.strong_resistance, 1.05);
        levels.weak_resistance = above(levels.weak_resistance, 1.02);
        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::analysis::prediction::RiskLevel;

    fn plan(direction: Direction) -> StrategyPlan {
        StrategyPlan {
            direction,
            signal: TradeSignal::from(direction),
            confidence: 70,
            entry_zone: None,
            stop_loss: None,
            take_profit: Vec::new(),
            key_levels: KeyLevels::default(),
            reasoning: Vec::new(),
            risk_level: RiskLevel::Medium,
            risk_notes: Vec::new(),
            summary: String::new(),
        }
    }

    #[test]
    fn test_consistent_long_is_kept() {
        let mut p = plan(Direction::Bullish);
        p.entry_zone = Some(PriceZone::new(98.0, 100.0));
        p.stop_loss = Some(95.0);
        p.take_profit = vec![106.0, 110.0];

        let out = StrategyGuard::new(100.0, None).apply(p);
        assert_eq!(out.signal, TradeSignal::Long);
        assert_eq!(out.stop_loss, Some(95.0));
        assert_eq!(out.take_profit, vec![106.0, 110.0]);
        assert!(out.reasoning.is_empty());
    }

    #[test]
    fn test_direction_conflict_downgrades_to_wait() {
        let mut p = plan(Direction::Bullish);
        p.entry_zone = Some(PriceZone::new(100.0, 100.0));
        p.take_profit = vec![90.0];

        let out = StrategyGuard::new(100.0, None).apply(p);
        assert_eq!(out.direction, Direction::Neutral);
        assert_eq!(out.signal, TradeSignal::Wait);
        assert!(out.reasoning[0].contains("conflict"));
        assert_eq!(out.risk_notes.len(), 1);
    }

    #[test]
    fn test_neutral_text_takes_price_direction() {
        let mut p = plan(Direction::Neutral);
        p.take_profit = vec![90.0];
        p.stop_loss = Some(104.0);

        let out = StrategyGuard::new(100.0, None).apply(p);
        assert_eq!(out.signal, TradeSignal::Short);
    }

    #[test]
    fn test_chasing_long_entry_is_clamped() {
        let mut p = plan(Direction::Bullish);
        p.entry_zone = Some(PriceZone::new(103.0, 105.0));
        p.stop_loss = Some(97.0);
        p.take_profit = vec![115.0];

        let out = StrategyGuard::new(100.0, None).apply(p);
        let entry = out.entry_zone.unwrap();
        assert_eq!(entry.high, 100.0);
        assert!((entry.low - 99.5).abs() < 1e-9);
    }

    #[test]
    fn test_wrong_side_stop_uses_atr() {
        let mut p = plan(Direction::Bullish);
        p.entry_zone = Some(PriceZone::new(99.0, 100.0));
        p.stop_loss = Some(101.0);
        p.take_profit = vec![110.0];

        let out = StrategyGuard::new(100.0, Some(2.0)).apply(p);
        assert_eq!(out.stop_loss, Some(96.0));
        assert_eq!(out.signal, TradeSignal::Long);
    }

    #[test]
    fn test_short_without_targets_gets_defaults() {
        let mut p = plan(Direction::Bearish);
        p.entry_zone = Some(PriceZone::new(100.0, 100.0));
        p.stop_loss = Some(101.0);

        let out = StrategyGuard::new(100.0, None).apply(p);
        assert_eq!(out.take_profit.len(), 3);
        assert!((out.take_profit[0] - 98.0).abs() < 1e-9);
        assert!(out.take_profit.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_poor_reward_risk_downgrades() {
        let mut p = plan(Direction::Bullish);
        p.entry_zone = Some(PriceZone::new(100.0, 100.0));
        p.stop_loss = Some(90.0);
        p.take_profit = vec![102.0];

        let out = StrategyGuard::new(100.0, None).apply(p);
        assert_eq!(out.signal, TradeSignal::Wait);
        assert!(out.reasoning[0].contains("Reward/risk"));
    }

    #[test]
    fn test_key_levels_anchored_to_price() {
        let mut p = plan(Direction::Neutral);
        p.key_levels = KeyLevels {
            strong_resistance: Some(99.0),
            weak_resistance: Some(101.0),
            current_price: Some(42.0),
            weak_support: Some(100.0),
            strong_support: Some(90.0),
        };

        let out = StrategyGuard::new(100.0, None).apply(p);
        let kl = out.key_levels;
        assert_eq!(kl.current_price, Some(100.0));
        assert_eq!(kl.strong_resistance, Some(105.0));
        assert_eq!(kl.weak_resistance, Some(101.0));
        assert_eq!(kl.weak_support, Some(98.0));
        assert_eq!(kl.strong_support, Some(90.0));
    }
}
