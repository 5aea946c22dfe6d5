mod backoff;
mod monitor;

pub use backoff::BackoffPolicy;
pub use monitor::{HealthMonitor, Heartbeat};
