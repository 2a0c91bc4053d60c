pub mod cancel;
pub mod limiter;
pub mod retry;

pub use cancel::{CancelGuard, CancelToken};
pub use limiter::ConcurrencyLimiter;
pub use retry::RetryPolicy;
