// Analysis domain (indicators, contexts, predictions)
pub mod analysis;

// Market data domain
pub mod market;

// Port interfaces
pub mod ports;

// Domain-specific error types
pub mod errors;
