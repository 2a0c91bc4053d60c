//! Push-based observability for Chainsight
//!
//! Metrics leave the process only as outbound data: periodic JSON lines on
//! stdout and the Prometheus text rendering. There is no HTTP listener.

pub mod metrics;
pub mod reporter;

pub use metrics::Metrics;
pub use reporter::MetricsReporter;
