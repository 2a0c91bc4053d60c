pub mod broadcaster;

pub use broadcaster::{StreamBroadcaster, StreamEvent, Subscription, Topic};
