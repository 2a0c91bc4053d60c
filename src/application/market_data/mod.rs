pub mod market_data_source;
pub mod ticker_feed;
pub mod volatility_monitor;

pub use market_data_source::MarketDataSource;
pub use ticker_feed::TickerFeed;
pub use volatility_monitor::{AlertKind, AlertSeverity, MarketAlert, VolatilityMonitor};
