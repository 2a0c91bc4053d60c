pub mod inference_client;
pub mod prompt;
pub mod response_parser;
pub mod strategy_guard;

pub use inference_client::{InferenceClient, InferenceConfig, InferenceEvent, InferenceStream};
pub use strategy_guard::StrategyGuard;
