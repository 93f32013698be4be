use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Everything one storage node needs to run.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub listen_host: String,
    pub listen_port: u16,
    pub coordinator_addr: SocketAddr,
    pub capacity_bytes: u64,
    pub bandwidth_bps: u64,
    pub heartbeat_interval: Duration,
    pub base_latency: Duration,
    pub verify_on_read: bool,
}

impl NodeConfig {
    pub fn builder(node_id: impl Into<String>, coordinator_addr: SocketAddr) -> NodeConfigBuilder {
        NodeConfigBuilder::new(node_id, coordinator_addr)
    }
}

/// Builder with the defaults a production node would use; tests dial the
/// intervals down.
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    pub fn new(node_id: impl Into<String>, coordinator_addr: SocketAddr) -> Self {
        Self {
            config: NodeConfig {
                node_id: node_id.into(),
                listen_host: "127.0.0.1".into(),
                listen_port: 0,
                coordinator_addr,
                capacity_bytes: 100 * 1024 * 1024 * 1024,
                bandwidth_bps: 1_000_000_000,
                heartbeat_interval: Duration::from_secs(3),
                base_latency: Duration::from_millis(10),
                verify_on_read: true,
            },
        }
    }

    pub fn listen(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.listen_host = host.into();
        self.config.listen_port = port;
        self
    }

    pub fn capacity_bytes(mut self, bytes: u64) -> Self {
        self.config.capacity_bytes = bytes;
        self
    }

    pub fn bandwidth_bps(mut self, bps: u64) -> Self {
        self.config.bandwidth_bps = bps;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn base_latency(mut self, latency: Duration) -> Self {
        self.config.base_latency = latency;
        self
    }

    pub fn verify_on_read(mut self, verify: bool) -> Self {
        self.config.verify_on_read = verify;
        self
    }

    pub fn build(self) -> NodeConfig {
        self.config
    }
}

/// Point-in-time view of a node's resources, derived from the chunk store
/// and the bandwidth ledger. Computed fresh on every request; nothing here
/// accumulates across calls.
#[derive(Debug, Clone, Serialize)]
pub struct NodeMetricsSnapshot {
    pub node_id: String,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub utilisation_bps: f64,
    pub bandwidth_bps: u64,
    pub chunks_stored: usize,
    pub transfers_completed: u64,
    pub uptime_seconds: u64,
}
