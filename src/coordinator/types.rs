use crate::integrity::Checksum;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeLifecycle {
    Registering,
    Healthy,
    Failed,
    Decommissioned,
}

/// What the coordinator knows about one storage node.
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub node_id: String,
    pub addr: SocketAddr,
    pub capacity_bytes: u64,
    pub bandwidth_bps: u64,
    pub lifecycle: NodeLifecycle,
    /// Last reported usage, from the most recent heartbeat.
    pub used_bytes: u64,
    /// Last reported link utilisation in bits/second.
    pub utilisation_bps: f64,
    pub chunks_stored: u64,
}

impl NodeDescriptor {
    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }
}

/// The committed description of one stored file. Created when the last chunk
/// reaches its replication target; downloads only ever see committed
/// manifests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileManifest {
    pub file_id: String,
    pub display_name: String,
    pub total_size: u64,
    pub chunk_count: u32,
    pub chunk_size: u64,
    pub replication_factor: u32,
    pub chunk_checksums: Vec<Checksum>,
    pub created_at: i64,
}

impl FileManifest {
    /// Exact byte length of chunk `index` (the last chunk may be short).
    pub fn chunk_len(&self, index: u32) -> u64 {
        if index + 1 == self.chunk_count {
            self.total_size - u64::from(index) * self.chunk_size
        } else {
            self.chunk_size
        }
    }
}

/// A 128-bit collision-resistant file identifier, rendered as 32 lowercase
/// hex characters.
pub fn new_file_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn is_valid_file_id(raw: &str) -> bool {
    raw.len() == 32 && raw.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}
