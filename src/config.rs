//! Cluster tunables.
//!
//! Every knob lives in a plain struct with a `Default` impl so tests can
//! override individual fields without a config file.

use serde::Deserialize;
use std::time::Duration;

/// Chunk-size tiers keyed on total file size.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkingConfig {
    pub small_file_threshold: u64,
    pub medium_file_threshold: u64,
    pub small_chunk_size: u64,
    pub medium_chunk_size: u64,
    pub large_chunk_size: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            small_file_threshold: 10 * 1024 * 1024,
            medium_file_threshold: 100 * 1024 * 1024,
            small_chunk_size: 512 * 1024,
            medium_chunk_size: 2 * 1024 * 1024,
            large_chunk_size: 10 * 1024 * 1024,
        }
    }
}

impl ChunkingConfig {
    /// Pick the chunk size tier for a file of `total_size` bytes.
    pub fn chunk_size_for(&self, total_size: u64) -> u64 {
        if total_size < self.small_file_threshold {
            self.small_chunk_size
        } else if total_size < self.medium_file_threshold {
            self.medium_chunk_size
        } else {
            self.large_chunk_size
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    pub default_factor: u32,
    pub max_factor: u32,
    /// Placement strategy name: "diverse", "least_loaded", or "random".
    pub placement_strategy: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            default_factor: 3,
            max_factor: 5,
            placement_strategy: "diverse".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// How often a node emits a heartbeat.
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    /// How often the monitor evaluates node health.
    #[serde(with = "duration_secs")]
    pub tick_interval: Duration,
    /// Silence longer than this marks a node FAILED.
    #[serde(with = "duration_secs")]
    pub failure_timeout: Duration,
    /// How long a stale chunk survives on a recovered node before eviction.
    #[serde(with = "duration_secs")]
    pub gc_grace: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(3),
            tick_interval: Duration::from_secs(1),
            failure_timeout: Duration::from_secs(30),
            gc_grace: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// End-to-end deadline for a single RPC.
    #[serde(with = "duration_secs")]
    pub rpc_timeout: Duration,
    /// Transport-level retry attempts inside one RPC.
    pub retry_attempts: u32,
    /// Base delay between transport retries.
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,
    /// Fixed latency added to the modelled transfer time of each chunk.
    #[serde(with = "duration_millis")]
    pub base_latency: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(60),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(150),
            base_latency: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepairConfig {
    /// Periodic under-replication sweep.
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
    /// Chunk copies in flight at once.
    pub max_parallel: usize,
    /// Attempts per chunk before it stays degraded until the next sweep.
    pub max_attempts: u32,
    #[serde(with = "duration_secs")]
    pub backoff_base: Duration,
    #[serde(with = "duration_secs")]
    pub backoff_cap: Duration,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            max_parallel: 4,
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Put retries per target before a replacement node is chosen.
    pub max_put_retries: u32,
    /// Re-verify stored bytes on every read.
    pub verify_on_read: bool,
    /// Uncommitted upload sessions older than this are aborted and their
    /// chunks collected.
    #[serde(with = "duration_secs")]
    pub session_timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_put_retries: 3,
            verify_on_read: true,
            session_timeout: Duration::from_secs(600),
        }
    }
}

/// Everything the coordinator and nodes need, with sane defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub chunking: ChunkingConfig,
    pub replication: ReplicationConfig,
    pub monitor: MonitorConfig,
    pub network: NetworkConfig,
    pub repair: RepairConfig,
    pub upload: UploadConfig,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_tiers() {
        let config = ChunkingConfig::default();

        assert_eq!(config.chunk_size_for(1024), 512 * 1024);
        assert_eq!(config.chunk_size_for(10 * 1024 * 1024), 2 * 1024 * 1024);
        assert_eq!(config.chunk_size_for(50 * 1024 * 1024), 2 * 1024 * 1024);
        assert_eq!(config.chunk_size_for(500 * 1024 * 1024), 10 * 1024 * 1024);
    }

    #[test]
    fn defaults_match_contract() {
        let config = ClusterConfig::default();

        assert_eq!(config.monitor.heartbeat_interval, Duration::from_secs(3));
        assert_eq!(config.monitor.failure_timeout, Duration::from_secs(30));
        assert_eq!(config.repair.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.repair.max_parallel, 4);
        assert_eq!(config.replication.default_factor, 3);
    }

    #[test]
    fn config_deserializes_from_json() {
        let raw = r#"{"replication": {"default_factor": 2, "max_factor": 4, "placement_strategy": "random"}}"#;
        let config: ClusterConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.replication.default_factor, 2);
        assert_eq!(config.replication.placement_strategy, "random");
        // untouched sections keep their defaults
        assert_eq!(config.repair.max_parallel, 4);
    }
}
