//! The re-replication engine.
//!
//! Repairs are driven by three inputs: failure events, a periodic sweep, and
//! suspect reports from the download path. Each degraded chunk becomes a
//! task — PENDING → IN_FLIGHT → DONE or FAILED — with a bounded number of
//! copies in flight at once and exponential backoff between attempts.

use crate::config::RepairConfig;
use crate::coordinator::error::{CoordinatorError, CoordinatorResult};
use crate::coordinator::registry::NodeRegistry;
use crate::coordinator::rpc::NodeRpc;
use crate::coordinator::types::FileManifest;
use crate::index::ReplicaIndex;
use crate::integrity::IntegrityVerifier;
use crate::metrics;
use crate::monitor::HeartbeatMonitor;
use crate::placement::PlacementPolicy;
use crate::store::ChunkKey;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Work signals accepted by the engine.
#[derive(Debug)]
pub enum RepairSignal {
    /// A node was declared FAILED; its chunks are already dropped from the
    /// index and need re-replication.
    NodeFailed { node_id: String },
    /// A replica served bytes that failed verification.
    Suspect { key: ChunkKey, node_id: String },
    /// Operator-requested sweep.
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Pending,
    InFlight,
}

struct RepairTask {
    state: TaskState,
    attempts: u32,
    retry_after: Instant,
}

pub struct RepairEngine {
    config: RepairConfig,
    registry: Arc<NodeRegistry>,
    monitor: Arc<HeartbeatMonitor>,
    index: Arc<ReplicaIndex>,
    rpc: Arc<NodeRpc>,
    policy: Arc<PlacementPolicy>,
    manifests: Arc<DashMap<String, FileManifest>>,
    semaphore: Arc<Semaphore>,
    tasks: Arc<DashMap<ChunkKey, RepairTask>>,
    signal_tx: mpsc::UnboundedSender<RepairSignal>,
}

impl RepairEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RepairConfig,
        registry: Arc<NodeRegistry>,
        monitor: Arc<HeartbeatMonitor>,
        index: Arc<ReplicaIndex>,
        rpc: Arc<NodeRpc>,
        policy: Arc<PlacementPolicy>,
        manifests: Arc<DashMap<String, FileManifest>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RepairSignal>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_parallel)),
            config,
            registry,
            monitor,
            index,
            rpc,
            policy,
            manifests,
            tasks: Arc::new(DashMap::new()),
            signal_tx,
        });
        (engine, signal_rx)
    }

    /// Handle for other components (download, the service) to feed work in.
    pub fn signal_sender(&self) -> mpsc::UnboundedSender<RepairSignal> {
        self.signal_tx.clone()
    }

    /// Chunks of committed files currently below their replication target.
    pub fn under_replicated_count(&self) -> u64 {
        let mut count = 0u64;
        for manifest in self.manifests.iter() {
            for index in 0..manifest.chunk_count {
                let key = ChunkKey::new(manifest.file_id.clone(), index);
                if self.index.replica_count(&key) < manifest.replication_factor {
                    count += 1;
                }
            }
        }
        count
    }

    /// Work loop: consume signals, sweep periodically, spawn bounded repair
    /// tasks.
    pub async fn run(
        self: &Arc<Self>,
        mut signal_rx: mpsc::UnboundedReceiver<RepairSignal>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(sweep = ?self.config.sweep_interval, "re-replication engine started");

        loop {
            tokio::select! {
                signal = signal_rx.recv() => {
                    match signal {
                        Some(RepairSignal::Suspect { key, node_id }) => {
                            let engine = self.clone();
                            tokio::spawn(async move {
                                engine.handle_suspect(key, node_id).await;
                            });
                        }
                        Some(RepairSignal::NodeFailed { node_id }) => {
                            debug!(node_id, "repair triggered by node failure");
                            self.schedule_repairs();
                        }
                        Some(RepairSignal::Admin) => self.schedule_repairs(),
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    self.schedule_repairs();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("re-replication engine stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Re-verify a suspect replica; evict it if it really is corrupt, then
    /// let the normal repair path restore the count.
    async fn handle_suspect(self: &Arc<Self>, key: ChunkKey, node_id: String) {
        let Some(manifest) = self.manifests.get(&key.file_id).map(|m| m.clone()) else {
            return;
        };
        let expected = manifest.chunk_checksums[key.index as usize];

        let Some(addr) = self.registry.addr_of(&node_id) else {
            return;
        };

        let verdict = match self.rpc.get_chunk(addr, &key).await {
            Ok(bytes) => IntegrityVerifier::verify(&bytes, &expected).is_err(),
            // CorruptOnRead from the node is a confirmed corruption too
            Err(CoordinatorError::Wire(crate::wire::WireError::Remote { category, .. })) => {
                category == crate::wire::ErrorCategory::Integrity
            }
            Err(_) => false,
        };

        if verdict {
            warn!(chunk = %key, node_id = %node_id, "corrupt replica confirmed, evicting");
            if let Err(e) = self.rpc.delete_chunk(addr, &key).await {
                debug!(chunk = %key, node_id = %node_id, error = %e, "evict delete failed");
            }
            self.index.unregister(&key, &node_id);
            self.schedule_repairs();
        }
    }

    /// Find degraded chunks and spawn a task per chunk, respecting backoff
    /// and the in-flight bound.
    fn schedule_repairs(self: &Arc<Self>) {
        let now = Instant::now();
        let mut spawned = 0usize;

        for manifest in self.manifests.iter() {
            let manifest = manifest.clone();
            for index in 0..manifest.chunk_count {
                let key = ChunkKey::new(manifest.file_id.clone(), index);
                let current = self.index.replica_count(&key);
                if current >= manifest.replication_factor {
                    continue;
                }
                if current == 0 {
                    error!(chunk = %key, "all replicas lost; chunk is unrecoverable");
                    continue;
                }

                // skip chunks already queued, in flight, or backing off
                let mut entry = self.tasks.entry(key.clone()).or_insert(RepairTask {
                    state: TaskState::Pending,
                    attempts: 0,
                    retry_after: now,
                });
                if entry.state == TaskState::InFlight || entry.retry_after > now {
                    continue;
                }
                entry.state = TaskState::InFlight;
                drop(entry);

                spawned += 1;
                let engine = self.clone();
                let manifest = manifest.clone();
                tokio::spawn(async move {
                    engine.repair_chunk(key, manifest).await;
                });
            }
        }

        let degraded = self.under_replicated_count();
        metrics::record_under_replicated(degraded as usize);
        if spawned > 0 {
            info!(spawned, degraded, "repair tasks scheduled");
        }
    }

    /// One repair attempt: pick a source and a fresh target, copy, verify,
    /// register.
    async fn repair_chunk(self: &Arc<Self>, key: ChunkKey, manifest: FileManifest) {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("repair semaphore never closes");

        metrics::record_repair_started();
        let outcome = self.copy_one_replica(&key, &manifest).await;

        match outcome {
            Ok(node_id) => {
                metrics::record_repair_completed();
                info!(chunk = %key, target = %node_id, "replica restored");
                self.tasks.remove(&key);
                // more than one replica may be missing; go again
                if self.index.replica_count(&key) < manifest.replication_factor {
                    let _ = self.signal_tx.send(RepairSignal::Admin);
                }
            }
            Err(e) => {
                let mut give_up = false;
                if let Some(mut task) = self.tasks.get_mut(&key) {
                    task.attempts += 1;
                    task.state = TaskState::Pending;
                    if task.attempts >= self.config.max_attempts {
                        give_up = true;
                    } else {
                        let backoff = self
                            .config
                            .backoff_base
                            .saturating_mul(1 << (task.attempts - 1))
                            .min(self.config.backoff_cap);
                        task.retry_after = Instant::now() + backoff;
                        warn!(chunk = %key, error = %e, retry_in = ?backoff, "repair attempt failed");
                    }
                }
                if give_up {
                    metrics::record_repair_failed();
                    error!(chunk = %key, error = %e, "repair abandoned until next sweep");
                    self.tasks.remove(&key);
                }
            }
        }
    }

    async fn copy_one_replica(
        &self,
        key: &ChunkKey,
        manifest: &FileManifest,
    ) -> CoordinatorResult<String> {
        let holders = self.index.locations(key);

        // source: surviving healthy replica with the lowest reported load
        let mut sources: Vec<String> = holders
            .iter()
            .filter(|node_id| self.monitor.is_healthy(node_id))
            .cloned()
            .collect();
        sources.sort_by(|a, b| {
            self.registry
                .utilisation_of(a)
                .partial_cmp(&self.registry.utilisation_of(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let source = sources
            .first()
            .ok_or_else(|| CoordinatorError::ChunkUnavailable { key: key.clone() })?;
        let source_addr = self
            .registry
            .addr_of(source)
            .ok_or_else(|| CoordinatorError::UnknownNode(source.clone()))?;

        // target: any healthy node not already holding the chunk
        let exclude: HashSet<String> = holders.iter().cloned().collect();
        let candidates = self.registry.views(&self.monitor.healthy_nodes());
        let chunk_len = manifest.chunk_len(key.index);
        let target = self
            .policy
            .select(&candidates, 1, &exclude, chunk_len)?
            .remove(0);
        let target_addr = self
            .registry
            .addr_of(&target)
            .ok_or_else(|| CoordinatorError::UnknownNode(target.clone()))?;

        let expected = manifest.chunk_checksums[key.index as usize];
        let bytes = self.rpc.get_chunk(source_addr, key).await?;
        IntegrityVerifier::verify(&bytes, &expected)?;

        self.rpc
            .put_chunk(target_addr, key, &bytes, &expected)
            .await?;
        self.index.register(key.clone(), &target);
        Ok(target)
    }
}
