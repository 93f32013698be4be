pub mod health;
pub mod monitor;

pub use health::{HealthEvent, HealthTable, NodeHealth};
pub use monitor::HeartbeatMonitor;
