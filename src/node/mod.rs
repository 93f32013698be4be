pub mod error;
pub mod heartbeat;
pub mod server;
pub mod types;

pub use error::{NodeError, NodeResult};
pub use server::StorageNode;
pub use types::{NodeConfig, NodeConfigBuilder, NodeMetricsSnapshot};
