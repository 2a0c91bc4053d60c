pub mod binance;
pub mod core;
pub mod llm;
pub mod mock;
pub mod observability;
