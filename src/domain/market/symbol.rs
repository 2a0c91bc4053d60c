use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Known quote currencies, longest first so `USDT` wins over `USD`
const QUOTE_CURRENCIES: &[&str] = &["USDT", "USDC", "FDUSD", "BUSD", "USD", "BTC", "ETH"];

/// Default quote when only a base asset is supplied
const DEFAULT_QUOTE: &str = "USDT";

/// Low-priced assets quoted by the exchange per 1000 units
const THOUSAND_MULTIPLIER_BASES: &[&str] = &[
    "PEPE", "SHIB", "LUNC", "XEC", "FLOKI", "BONK", "RATS", "SATS",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid symbol '{input}': {reason}")]
pub struct SymbolParseError {
    pub input: String,
    pub reason: String,
}

/// Tradable pair, always held in normalized `BASE/QUOTE` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol {
    base: String,
    quote: String,
}

impl Symbol {
    /// Normalizes the many spellings users type (`btcusdt`, `ETH-USDT`, `sol/usdt`, `pepe`).
    pub fn parse(input: &str) -> Result<Self, SymbolParseError> {
        let err = |reason: &str| SymbolParseError {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let upper = input.trim().to_uppercase();
        if upper.is_empty() {
            return Err(err("empty symbol"));
        }

        let (base, quote) = if let Some((base, quote)) = upper.split_once(['/', '-', '_']) {
            (base.to_string(), quote.to_string())
        } else {
            let quote = QUOTE_CURRENCIES
                .iter()
                .find(|q| upper.ends_with(*q) && upper.len() > q.len());
            match quote {
                Some(q) => (upper[..upper.len() - q.len()].to_string(), q.to_string()),
                None => (upper.clone(), DEFAULT_QUOTE.to_string()),
            }
        };

        if base.is_empty() || quote.is_empty() {
            return Err(err("missing base or quote asset"));
        }
        if !base.chars().all(|c| c.is_ascii_alphanumeric())
            || !quote.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(err("assets must be alphanumeric"));
        }

        let plain = base.trim_start_matches("1000");
        let base = if THOUSAND_MULTIPLIER_BASES.contains(&plain) {
            format!("1000{}", plain)
        } else {
            base
        };

        Ok(Self { base, quote })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// Exchange wire form without separator (`BTCUSDT`)
    pub fn to_exchange(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for Symbol {
    type Err = SymbolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Symbol::parse(s)
    }
}

impl TryFrom<String> for Symbol {
    type Error = SymbolParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Symbol::parse(&value)
    }
}

impl From<Symbol> for String {
    fn from(value: Symbol) -> Self {
        value.to_string()
    }
}
