//! The download path: resolve replicas, fetch, verify, fall back.

use crate::coordinator::error::{CoordinatorError, CoordinatorResult};
use crate::coordinator::registry::NodeRegistry;
use crate::coordinator::repair::RepairSignal;
use crate::coordinator::rpc::NodeRpc;
use crate::coordinator::types::FileManifest;
use crate::index::ReplicaIndex;
use crate::integrity::IntegrityVerifier;
use crate::monitor::HeartbeatMonitor;
use crate::store::ChunkKey;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct DownloadManager {
    registry: Arc<NodeRegistry>,
    monitor: Arc<HeartbeatMonitor>,
    index: Arc<ReplicaIndex>,
    rpc: Arc<NodeRpc>,
    repair_tx: mpsc::UnboundedSender<RepairSignal>,
}

impl DownloadManager {
    pub fn new(
        registry: Arc<NodeRegistry>,
        monitor: Arc<HeartbeatMonitor>,
        index: Arc<ReplicaIndex>,
        rpc: Arc<NodeRpc>,
        repair_tx: mpsc::UnboundedSender<RepairSignal>,
    ) -> Self {
        Self {
            registry,
            monitor,
            index,
            rpc,
            repair_tx,
        }
    }

    /// Fetch one chunk, trying replicas in least-utilised order. A replica
    /// whose bytes do not hash to the manifest checksum is reported to the
    /// repair engine as suspect and the next replica is tried; replicas are
    /// never modified by a read.
    pub async fn fetch_chunk(
        &self,
        manifest: &FileManifest,
        index: u32,
    ) -> CoordinatorResult<Bytes> {
        let key = ChunkKey::new(manifest.file_id.clone(), index);
        let expected = &manifest.chunk_checksums[index as usize];

        let mut replicas: Vec<String> = self
            .index
            .locations(&key)
            .into_iter()
            .filter(|node_id| self.monitor.is_healthy(node_id))
            .collect();
        replicas.sort_by(|a, b| {
            self.registry
                .utilisation_of(a)
                .partial_cmp(&self.registry.utilisation_of(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        for node_id in replicas {
            let Some(addr) = self.registry.addr_of(&node_id) else {
                continue;
            };

            let bytes = match self.rpc.get_chunk(addr, &key).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(chunk = %key, node_id = %node_id, error = %e, "replica read failed");
                    continue;
                }
            };

            if IntegrityVerifier::verify(&bytes, expected).is_err() {
                warn!(chunk = %key, node_id = %node_id, "replica failed verification, marking suspect");
                let _ = self.repair_tx.send(RepairSignal::Suspect {
                    key: key.clone(),
                    node_id,
                });
                continue;
            }

            return Ok(bytes);
        }

        Err(CoordinatorError::ChunkUnavailable { key })
    }
}
