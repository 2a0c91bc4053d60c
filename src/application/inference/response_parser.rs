//! Extraction of a [`StrategyPlan`] from complete model output.

use crate::domain::analysis::prediction::{
    Direction, KeyLevels, PriceZone, RiskLevel, StrategyPlan, TradeSignal,
};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResponseParseError {
    #[error("No JSON object found in model output")]
    NoJson,

    #[error("Model output is not valid strategy JSON: {0}")]
    Invalid(String),
}

/// Returns the body of the last fenced ```json block, or the first balanced
/// top-level `{...}` object when the output has no fence.
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(fenced) = last_fenced_block(text) {
        return Some(fenced);
    }
    balanced_objects(text).into_iter().next()
}

fn last_fenced_block(text: &str) -> Option<&str> {
    let mut found = None;
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after_ticks = &rest[start + 3..];
        let Some(end) = after_ticks.find("```") else {
            break;
        };
        let block = &after_ticks[..end];
        let body = block
            .strip_prefix("json")
            .or_else(|| block.strip_prefix("JSON"))
            .unwrap_or(block)
            .trim();
        if body.starts_with('{') {
            found = Some(body);
        }
        rest = &after_ticks[end + 3..];
    }
    found
}

fn balanced_objects(text: &str) -> Vec<&str> {
    let mut objects = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        objects.push(&text[s..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    objects
}

/// Parses complete model output into a strategy.
///
/// Field parsing is lenient: numbers may arrive as strings and missing optional
/// sections default to empty. Direction and risk level are read from free text.
pub fn parse_strategy(text: &str) -> Result<StrategyPlan, ResponseParseError> {
    let json = extract_json(text).ok_or(ResponseParseError::NoJson)?;
    let value: Value =
        serde_json::from_str(json).map_err(|e| ResponseParseError::Invalid(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| ResponseParseError::Invalid("top level is not an object".to_string()))?;

    let prediction = obj
        .get("prediction")
        .or_else(|| obj.get("direction"))
        .and_then(Value::as_str)
        .ok_or_else(|| ResponseParseError::Invalid("missing prediction".to_string()))?;
    let direction = Direction::from_text(prediction);

    let confidence = obj
        .get("confidence")
        .and_then(number)
        .map(|c| c.clamp(0.0, 100.0).round() as u8)
        .unwrap_or(0);

    let entry_zone = obj.get("entry_zone").and_then(|zone| {
        let low = zone.get("low").and_then(number)?;
        let high = zone.get("high").and_then(number)?;
        Some(PriceZone::new(low, high))
    });

    let take_profit = match obj.get("take_profit") {
        Some(Value::Array(items)) => items.iter().filter_map(number).collect(),
        Some(other) => number(other).into_iter().collect(),
        None => Vec::new(),
    };

    let key_levels = obj
        .get("key_levels")
        .map(|kl| KeyLevels {
            strong_resistance: kl.get("strong_resistance").and_then(number),
            weak_resistance: kl.get("weak_resistance").and_then(number),
            current_price: kl.get("current_price").and_then(number),
            weak_support: kl.get("weak_support").and_then(number),
            strong_support: kl.get("strong_support").and_then(number),
        })
        .unwrap_or_default();

    Ok(StrategyPlan {
        direction,
        signal: TradeSignal::from(direction),
        confidence,
        entry_zone,
        stop_loss: obj.get("stop_loss").and_then(number),
        take_profit,
        key_levels,
        reasoning: strings(obj.get("reasoning")),
        risk_level: obj
            .get("risk_level")
            .and_then(Value::as_str)
            .map(RiskLevel::from_text)
            .unwrap_or_default(),
        risk_notes: strings(obj.get("risk_warning").or_else(|| obj.get("risk_notes"))),
        summary: obj
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

/// Positive finite number, or a string holding one
fn number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().replace(',', "").parse().ok()?,
        _ => return None,
    };
    (n.is_finite() && n > 0.0).then_some(n)
}

fn strings(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"{
        "prediction": "Bullish",
        "confidence": 72,
        "reasoning": ["RSI recovering", "price above {sma}"],
        "key_levels": {"strong_resistance": 71000, "current_price": "68000", "strong_support": 65000},
        "entry_zone": {"low": 67900, "high": 67500},
        "stop_loss": 66500,
        "take_profit": [69500, "70,500"],
        "risk_level": "high",
        "risk_warning": ["funding elevated"],
        "summary": "Trend continuation"
    }"#;

    #[test]
    fn test_parse_fenced_response() {
        let text = format!("Thinking...\n```json\n{}\n```\nDone.", BODY);
        let plan = parse_strategy(&text).unwrap();

        assert_eq!(plan.direction, Direction::Bullish);
        assert_eq!(plan.signal, TradeSignal::Long);
        assert_eq!(plan.confidence, 72);
        assert_eq!(plan.entry_zone, Some(PriceZone::new(67500.0, 67900.0)));
        assert_eq!(plan.take_profit, vec![69500.0, 70500.0]);
        assert_eq!(plan.key_levels.current_price, Some(68000.0));
        assert_eq!(plan.risk_level, RiskLevel::High);
        assert_eq!(plan.reasoning.len(), 2);
        assert_eq!(plan.risk_notes, vec!["funding elevated".to_string()]);
    }

    #[test]
    fn test_last_fence_wins() {
        let text = format!(
            "```json\n{{\"prediction\": \"bearish\"}}\n```\nrevised:\n```json\n{}\n```",
            BODY
        );
        assert_eq!(parse_strategy(&text).unwrap().direction, Direction::Bullish);
    }

    #[test]
    fn test_unfenced_object_with_braces_in_strings() {
        let text = format!("Here you go: {} trailing", BODY);
        let json = extract_json(&text).unwrap();
        assert!(json.starts_with('{') && json.ends_with('}'));
        assert!(parse_strategy(&text).is_ok());
    }

    #[test]
    fn test_missing_json_is_error() {
        assert_eq!(
            parse_strategy("the market looks bullish"),
            Err(ResponseParseError::NoJson)
        );
        assert!(matches!(
            parse_strategy("```json\n{\"prediction\": \n```"),
            Err(ResponseParseError::NoJson) | Err(ResponseParseError::Invalid(_))
        ));
        assert!(matches!(
            parse_strategy("{\"confidence\": 50}"),
            Err(ResponseParseError::Invalid(_))
        ));
    }

    #[test]
    fn test_confidence_clamped() {
        let plan = parse_strategy(r#"{"prediction": "neutral", "confidence": 250}"#).unwrap();
        assert_eq!(plan.confidence, 100);
        assert_eq!(plan.signal, TradeSignal::Wait);
        assert!(plan.entry_zone.is_none());
    }
}
