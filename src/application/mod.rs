// Cancellation, limiters and retry policy shared by every stage
pub mod concurrency;

// Market data acquisition and the live ticker feed
pub mod market_data;

// Indicators and context building
pub mod analysis;

// Model streaming, prompt and response handling
pub mod inference;

pub mod cache;
pub mod streaming;

// Per-symbol compute path and multi-symbol scans
pub mod pipeline;
pub mod scan;

// System orchestrator
pub mod system;
