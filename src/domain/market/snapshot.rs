use crate::domain::market::symbol::Symbol;
use crate::domain::market::timeframe::Timeframe;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One OHLCV bar. `timestamp` is the bar open time in unix milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderBookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Top-N order book levels, bids best first, asks best first
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OrderBook {
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
}

/// Condensed order book view handed to the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderBookSummary {
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub total_bid_volume: Decimal,
    pub total_ask_volume: Decimal,
    /// Bid volume divided by ask volume, 1.0 when the ask side is empty
    pub bid_ask_ratio: f64,
    /// Bid level with the largest resting quantity
    pub major_support: Option<OrderBookLevel>,
    /// Ask level with the largest resting quantity
    pub major_resistance: Option<OrderBookLevel>,
}

impl OrderBook {
    pub fn summary(&self) -> OrderBookSummary {
        let total_bid_volume: Decimal = self.bids.iter().map(|l| l.quantity).sum();
        let total_ask_volume: Decimal = self.asks.iter().map(|l| l.quantity).sum();

        let bid_ask_ratio = if total_ask_volume > Decimal::ZERO {
            let ratio = (total_bid_volume / total_ask_volume).round_dp(4);
            ratio.to_f64().unwrap_or(1.0)
        } else {
            1.0
        };

        // ties resolve to the level closest to the touch
        let largest = |levels: &[OrderBookLevel]| {
            levels
                .iter()
                .fold(None::<&OrderBookLevel>, |best, level| match best {
                    Some(b) if b.quantity >= level.quantity => Some(b),
                    _ => Some(level),
                })
                .cloned()
        };

        OrderBookSummary {
            best_bid: self.bids.first().map(|l| l.price),
            best_ask: self.asks.first().map(|l| l.price),
            total_bid_volume,
            total_ask_volume,
            bid_ask_ratio,
            major_support: largest(&self.bids),
            major_resistance: largest(&self.asks),
        }
    }
}

/// Rolling 24h statistics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticker24h {
    pub symbol: Symbol,
    pub last_price: Decimal,
    pub price_change_percent: Decimal,
    pub high_price: Decimal,
    pub low_price: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
}

/// One immutable fetch of market data for a symbol.
///
/// Built once by a provider and never mutated afterwards. Freshness is judged
/// against `fetched_at` (unix ms) by the context aggregator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketSnapshot {
    symbol: Symbol,
    fetched_at: i64,
    series: BTreeMap<Timeframe, Vec<Candle>>,
    order_book: OrderBook,
    ticker: Option<Ticker24h>,
}

impl MarketSnapshot {
    pub fn new(
        symbol: Symbol,
        fetched_at: i64,
        series: BTreeMap<Timeframe, Vec<Candle>>,
        order_book: OrderBook,
        ticker: Option<Ticker24h>,
    ) -> Self {
        Self {
            symbol,
            fetched_at,
            series,
            order_book,
            ticker,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn fetched_at(&self) -> i64 {
        self.fetched_at
    }

    /// Snapshot age at `now_ms`. A timestamp in the future counts as zero age.
    pub fn age_ms(&self, now_ms: i64) -> u64 {
        now_ms.saturating_sub(self.fetched_at).max(0) as u64
    }

    pub fn series(&self, timeframe: Timeframe) -> Option<&[Candle]> {
        self.series.get(&timeframe).map(Vec::as_slice)
    }

    pub fn timeframes(&self) -> impl Iterator<Item = Timeframe> + '_ {
        self.series.keys().copied()
    }

    pub fn order_book(&self) -> &OrderBook {
        &self.order_book
    }

    pub fn ticker(&self) -> Option<&Ticker24h> {
        self.ticker.as_ref()
    }

    /// Latest close across the shortest available timeframe
    pub fn last_price(&self) -> Option<Decimal> {
        if let Some(ticker) = &self.ticker {
            return Some(ticker.last_price);
        }
        self.series
            .values()
            .next()
            .and_then(|candles| candles.last())
            .map(|c| c.close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(price: Decimal, quantity: Decimal) -> OrderBookLevel {
        OrderBookLevel { price, quantity }
    }

    #[test]
    fn test_order_book_summary() {
        let book = OrderBook {
            bids: vec![
                level(dec!(100), dec!(1)),
                level(dec!(99), dec!(5)),
                level(dec!(98), dec!(2)),
            ],
            asks: vec![level(dec!(101), dec!(3)), level(dec!(102), dec!(1))],
        };

        let summary = book.summary();
        assert_eq!(summary.best_bid, Some(dec!(100)));
        assert_eq!(summary.best_ask, Some(dec!(101)));
        assert_eq!(summary.total_bid_volume, dec!(8));
        assert_eq!(summary.total_ask_volume, dec!(4));
        assert_eq!(summary.bid_ask_ratio, 2.0);
        assert_eq!(summary.major_support.unwrap().price, dec!(99));
        assert_eq!(summary.major_resistance.unwrap().price, dec!(101));
    }

    #[test]
    fn test_empty_order_book_summary() {
        let summary = OrderBook::default().summary();
        assert_eq!(summary.bid_ask_ratio, 1.0);
        assert!(summary.major_support.is_none());
        assert!(summary.best_ask.is_none());
    }

    #[test]
    fn test_snapshot_age_clamps_future_timestamps() {
        let symbol = Symbol::parse("BTCUSDT").unwrap();
        let snapshot =
            MarketSnapshot::new(symbol, 10_000, BTreeMap::new(), OrderBook::default(), None);
        assert_eq!(snapshot.age_ms(12_500), 2_500);
        assert_eq!(snapshot.age_ms(9_000), 0);
    }

    #[test]
    fn test_last_price_falls_back_to_shortest_series() {
        let symbol = Symbol::parse("ETHUSDT").unwrap();
        let candle = |close: Decimal| Candle {
            timestamp: 0,
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
        };
        let mut series = BTreeMap::new();
        series.insert(Timeframe::OneHour, vec![candle(dec!(2000))]);
        series.insert(Timeframe::FiveMin, vec![candle(dec!(2010))]);
        let snapshot = MarketSnapshot::new(symbol, 0, series, OrderBook::default(), None);
        assert_eq!(snapshot.last_price(), Some(dec!(2010)));
    }
}
