// Market data domain
pub mod snapshot;
pub mod symbol;
pub mod timeframe;

pub use snapshot::{Candle, MarketSnapshot, OrderBook, OrderBookLevel, OrderBookSummary, Ticker24h};
pub use symbol::{Symbol, SymbolParseError};
pub use timeframe::Timeframe;
