use crate::domain::analysis::context::AnalysisContext;
use crate::domain::analysis::prediction::{PredictionParams, RiskProfile};
use std::fmt::Write;

pub const SYSTEM_PROMPT: &str = r#"# Role: Senior Quant Strategist
You are a rigorous crypto derivatives risk strategist. Using only the market context you are given, produce a high-probability, risk-controlled contract analysis and trade plan.

## Principles
1. Data first: every conclusion must come from the indicators provided.
2. Confluence: the best signals agree across trend, structure and order-book pressure.
3. Defense first: size the downside before the upside.

## Hard consistency rules
- Long: take_profit > entry > stop_loss, with the stop below key support.
- Short: take_profit < entry < stop_loss, with the stop above key resistance.
- First take-profit must offer a risk/reward of at least 1.2.
- No chasing: a long entry must be at or below the current price, a short entry at or above it.
- Stops reference 1.5 x ATR.

## Output (strict JSON only, inside one ```json block)
```json
{
  "prediction": "bullish|bearish|neutral",
  "confidence": 0,
  "reasoning": ["observation", "conflict", "conclusion", "risk"],
  "key_levels": {"strong_resistance": 0, "weak_resistance": 0, "current_price": 0, "weak_support": 0, "strong_support": 0},
  "entry_zone": {"low": 0, "high": 0},
  "stop_loss": 0,
  "take_profit": [0, 0, 0],
  "risk_level": "low|medium|high|extreme",
  "risk_warning": ["..."],
  "summary": "one paragraph"
}
```
"#;

fn risk_guidance(profile: RiskProfile) -> &'static str {
    match profile {
        RiskProfile::Conservative => {
            "Prefer WAIT unless at least two timeframes agree. Keep stops tight and targets modest."
        }
        RiskProfile::Moderate => "Balance opportunity against drawdown. Require a clear primary trend.",
        RiskProfile::Aggressive => {
            "Counter-trend setups are acceptable when momentum diverges. Wider targets are fine."
        }
    }
}

/// User message for one analysis request.
///
/// The market section is the context's canonical payload verbatim, so the same
/// context always yields the same prompt.
pub fn build_user_prompt(context: &AnalysisContext, params: &PredictionParams) -> String {
    let mut prompt = String::with_capacity(context.canonical_payload().len() + 512);

    let _ = writeln!(prompt, "# Analysis request: {}", context.symbol());
    let _ = writeln!(prompt, "Primary timeframe: {}", params.primary_timeframe);
    let timeframes: Vec<&str> = context.frames().iter().map(|f| f.timeframe.as_str()).collect();
    let _ = writeln!(prompt, "Timeframes: {}", timeframes.join(", "));
    let _ = writeln!(prompt, "Current price: {}", context.market().last_price);
    let _ = writeln!(
        prompt,
        "Risk profile: {} ({})",
        params.risk_profile,
        risk_guidance(params.risk_profile)
    );

    let _ = writeln!(prompt, "\n## Trend by timeframe");
    for frame in context.frames() {
        let ind = &frame.indicators;
        let _ = writeln!(
            prompt,
            "- {}: {:?}, close {}",
            frame.timeframe, ind.trend, ind.last_close
        );
    }

    let _ = writeln!(prompt, "\n## Market context (JSON)");
    let _ = writeln!(prompt, "```json\n{}\n```", context.canonical_payload());
    let _ = writeln!(
        prompt,
        "\nReturn the strategy for the {} timeframe as a single JSON object.",
        params.primary_timeframe
    );
    prompt
}
