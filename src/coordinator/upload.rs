//! The chunked upload pipeline.
//!
//! One session per in-flight upload. Chunks arrive in index order from the
//! client; each is checksummed, placed on `r` nodes, and written with the
//! per-chunk puts running concurrently. The manifest commits only after the
//! dense index range is complete, and a failed upload leaves nothing behind.

use crate::config::{ChunkingConfig, ReplicationConfig, UploadConfig};
use crate::coordinator::error::{CoordinatorError, CoordinatorResult};
use crate::coordinator::registry::NodeRegistry;
use crate::coordinator::rpc::NodeRpc;
use crate::coordinator::types::{new_file_id, FileManifest};
use crate::index::ReplicaIndex;
use crate::integrity::{Checksum, IntegrityVerifier};
use crate::metrics;
use crate::monitor::HeartbeatMonitor;
use crate::placement::PlacementPolicy;
use crate::store::ChunkKey;
use crate::wire::UploadAccepted;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct UploadSession {
    display_name: String,
    total_size: u64,
    chunk_size: u64,
    chunk_count: u32,
    replication: u32,
    chunk_checksums: Vec<Option<Checksum>>,
    started_at: Instant,
}

pub struct UploadManager {
    chunking: ChunkingConfig,
    replication: ReplicationConfig,
    upload: UploadConfig,
    registry: Arc<NodeRegistry>,
    monitor: Arc<HeartbeatMonitor>,
    index: Arc<ReplicaIndex>,
    rpc: Arc<NodeRpc>,
    policy: PlacementPolicy,
    manifests: Arc<DashMap<String, FileManifest>>,
    sessions: DashMap<String, UploadSession>,
}

impl UploadManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chunking: ChunkingConfig,
        replication: ReplicationConfig,
        upload: UploadConfig,
        registry: Arc<NodeRegistry>,
        monitor: Arc<HeartbeatMonitor>,
        index: Arc<ReplicaIndex>,
        rpc: Arc<NodeRpc>,
        policy: PlacementPolicy,
        manifests: Arc<DashMap<String, FileManifest>>,
    ) -> Self {
        Self {
            chunking,
            replication,
            upload,
            registry,
            monitor,
            index,
            rpc,
            policy,
            manifests,
            sessions: DashMap::new(),
        }
    }

    /// Open an upload session: validate, assign a file id, pick a chunk size.
    pub fn begin(
        &self,
        display_name: &str,
        total_size: u64,
        replication: u32,
    ) -> CoordinatorResult<UploadAccepted> {
        if display_name.is_empty() {
            return Err(CoordinatorError::InvalidRequest(
                "display_name must not be empty".into(),
            ));
        }
        if total_size == 0 {
            return Err(CoordinatorError::InvalidRequest(
                "refusing to store an empty file".into(),
            ));
        }
        if replication == 0 {
            return Err(CoordinatorError::InvalidRequest(
                "replication factor must be at least 1".into(),
            ));
        }
        if replication > self.replication.max_factor {
            return Err(CoordinatorError::InvalidRequest(format!(
                "replication factor {replication} exceeds the maximum {}",
                self.replication.max_factor
            )));
        }

        let file_id = new_file_id();
        let chunk_size = self.chunking.chunk_size_for(total_size);
        let chunk_count = total_size.div_ceil(chunk_size) as u32;

        info!(
            file_id = %file_id,
            display_name,
            total_size,
            chunk_count,
            replication,
            "upload session opened"
        );

        self.sessions.insert(
            file_id.clone(),
            UploadSession {
                display_name: display_name.to_string(),
                total_size,
                chunk_size,
                chunk_count,
                replication,
                chunk_checksums: vec![None; chunk_count as usize],
                started_at: Instant::now(),
            },
        );

        Ok(UploadAccepted {
            file_id,
            chunk_size,
        })
    }

    /// Place and write one chunk to its `r` target nodes.
    pub async fn put_chunk(
        &self,
        file_id: &str,
        index: u32,
        bytes: Bytes,
    ) -> CoordinatorResult<()> {
        let (expected_len, replication) = {
            let session = self
                .sessions
                .get(file_id)
                .ok_or_else(|| CoordinatorError::UploadNotFound(file_id.to_string()))?;

            if index >= session.chunk_count {
                return Err(CoordinatorError::InvalidRequest(format!(
                    "chunk index {index} out of range (file has {} chunks)",
                    session.chunk_count
                )));
            }
            let expected_len = if index + 1 == session.chunk_count {
                session.total_size - u64::from(index) * session.chunk_size
            } else {
                session.chunk_size
            };
            (expected_len, session.replication)
        };

        if bytes.len() as u64 != expected_len {
            return Err(CoordinatorError::InvalidRequest(format!(
                "chunk {index} carries {} bytes, expected {expected_len}",
                bytes.len()
            )));
        }

        let key = ChunkKey::new(file_id, index);
        let checksum = IntegrityVerifier::calculate_checksum(&bytes);

        match self.replicate_chunk(&key, &bytes, &checksum, replication).await {
            Ok(()) => {}
            Err(e) => {
                warn!(chunk = %key, error = %e, "chunk placement failed, aborting upload");
                self.abort(file_id).await;
                return Err(e);
            }
        }

        match self.sessions.get_mut(file_id) {
            Some(mut session) => {
                session.chunk_checksums[index as usize] = Some(checksum);
                Ok(())
            }
            None => {
                // the session was aborted while the puts were in flight;
                // take back what this chunk just wrote
                self.garbage_collect_file(file_id).await;
                Err(CoordinatorError::UploadNotFound(file_id.to_string()))
            }
        }
    }

    /// Drive the per-chunk puts until `r` nodes hold the chunk, replacing
    /// targets whose retry budget is spent.
    async fn replicate_chunk(
        &self,
        key: &ChunkKey,
        bytes: &Bytes,
        checksum: &Checksum,
        replication: u32,
    ) -> CoordinatorResult<()> {
        let mut holders: HashSet<String> = HashSet::new();
        let mut banned: HashSet<String> = HashSet::new();

        while (holders.len() as u32) < replication {
            let needed = replication as usize - holders.len();
            let exclude: HashSet<String> = holders.union(&banned).cloned().collect();
            let candidates = self.registry.views(&self.monitor.healthy_nodes());

            let targets = self
                .policy
                .select(&candidates, needed, &exclude, bytes.len() as u64)
                .map_err(|e| {
                    let crate::placement::PlacementError::InsufficientCandidates {
                        available,
                        ..
                    } = e;
                    CoordinatorError::InsufficientReplicas {
                        file_id: key.file_id.clone(),
                        needed: replication,
                        available: (holders.len() + available.len()) as u32,
                    }
                })?;

            let attempts = targets.into_iter().map(|node_id| {
                let addr = self.registry.addr_of(&node_id);
                async move {
                    match addr {
                        Some(addr) => {
                            let result = self.put_with_target_retries(addr, key, bytes, checksum).await;
                            (node_id, result)
                        }
                        None => (
                            node_id.clone(),
                            Err(CoordinatorError::UnknownNode(node_id)),
                        ),
                    }
                }
            });

            for (node_id, result) in join_all(attempts).await {
                match result {
                    Ok(()) => {
                        self.index.register(key.clone(), &node_id);
                        holders.insert(node_id);
                    }
                    Err(e) => {
                        warn!(chunk = %key, node_id = %node_id, error = %e, "replica put failed");
                        banned.insert(node_id);
                    }
                }
            }
        }

        debug!(chunk = %key, replicas = holders.len(), "chunk durable");
        Ok(())
    }

    /// Retry one target before giving up on it. Transport failures get the
    /// full budget; a node that answered with a capacity or integrity error
    /// will answer the same way again, so it is banned immediately.
    async fn put_with_target_retries(
        &self,
        addr: std::net::SocketAddr,
        key: &ChunkKey,
        bytes: &Bytes,
        checksum: &Checksum,
    ) -> CoordinatorResult<()> {
        let mut last_error = None;
        for _ in 0..self.upload.max_put_retries.max(1) {
            match self.rpc.put_chunk(addr, key, bytes, checksum).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let retryable =
                        e.category() == crate::wire::ErrorCategory::Transport;
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }
        Err(last_error.expect("retry budget is at least one"))
    }

    /// Publish the manifest; the file becomes visible to download here.
    pub fn commit(&self, file_id: &str) -> CoordinatorResult<FileManifest> {
        let (_, session) = self
            .sessions
            .remove(file_id)
            .ok_or_else(|| CoordinatorError::UploadNotFound(file_id.to_string()))?;

        let missing = session
            .chunk_checksums
            .iter()
            .filter(|c| c.is_none())
            .count() as u32;
        if missing > 0 {
            // put the session back so the client can finish it
            let file_id_owned = file_id.to_string();
            self.sessions.insert(file_id_owned, session);
            return Err(CoordinatorError::UploadIncomplete {
                file_id: file_id.to_string(),
                missing,
            });
        }

        let manifest = FileManifest {
            file_id: file_id.to_string(),
            display_name: session.display_name,
            total_size: session.total_size,
            chunk_count: session.chunk_count,
            chunk_size: session.chunk_size,
            replication_factor: session.replication,
            chunk_checksums: session
                .chunk_checksums
                .into_iter()
                .map(|c| c.expect("checked above"))
                .collect(),
            created_at: chrono::Utc::now().timestamp(),
        };

        self.manifests.insert(file_id.to_string(), manifest.clone());
        metrics::record_upload_committed(file_id);
        info!(
            file_id,
            chunks = manifest.chunk_count,
            replication = manifest.replication_factor,
            "upload committed"
        );
        Ok(manifest)
    }

    /// Tear an upload down and garbage-collect whatever was written.
    pub async fn abort(&self, file_id: &str) {
        if self.sessions.remove(file_id).is_some() {
            metrics::record_upload_failed(file_id);
            info!(file_id, "upload aborted, collecting partial chunks");
        }
        self.garbage_collect_file(file_id).await;
    }

    async fn garbage_collect_file(&self, file_id: &str) {
        let dropped = self.index.unregister_file(file_id);
        if dropped.is_empty() {
            return;
        }

        let deletions = dropped.into_iter().map(|(key, node_id)| {
            let addr = self.registry.addr_of(&node_id);
            async move {
                if let Some(addr) = addr {
                    if let Err(e) = self.rpc.delete_chunk(addr, &key).await {
                        debug!(chunk = %key, node_id = %node_id, error = %e, "gc delete failed");
                    }
                }
            }
        });
        join_all(deletions).await;
    }

    /// Whether `file_id` belongs to an upload still in flight.
    pub fn is_session_active(&self, file_id: &str) -> bool {
        self.sessions.contains_key(file_id)
    }

    /// Sessions older than `max_age` that never committed.
    pub fn expired_sessions(&self, max_age: Duration) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|entry| entry.started_at.elapsed() > max_age)
            .map(|entry| entry.key().clone())
            .collect()
    }
}
