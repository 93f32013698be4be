//! The coordinator process: RPC dispatch plus the lifecycle of the monitor,
//! repair, and garbage-collection tasks.

use crate::config::ClusterConfig;
use crate::coordinator::download::DownloadManager;
use crate::coordinator::error::{CoordinatorError, CoordinatorResult};
use crate::coordinator::registry::NodeRegistry;
use crate::coordinator::repair::{RepairEngine, RepairSignal};
use crate::coordinator::rpc::NodeRpc;
use crate::coordinator::types::{is_valid_file_id, FileManifest, NodeLifecycle};
use crate::index::ReplicaIndex;
use crate::integrity::checksum_to_hex;
use crate::metrics;
use crate::monitor::{HealthEvent, HeartbeatMonitor};
use crate::placement::{PlacementPolicy, Strategy};
use crate::store::ChunkKey;
use crate::coordinator::upload::UploadManager;
use crate::wire::{
    self, kind, ChunkData, Deregister, DownloadHeader, DownloadRequest, ErrorReply, Frame,
    Heartbeat, Register, StatusReport, UploadBegin, UploadChunkHeader, UploadCommit,
};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub struct CoordinatorService {
    config: ClusterConfig,
    registry: Arc<NodeRegistry>,
    monitor: Arc<HeartbeatMonitor>,
    index: Arc<ReplicaIndex>,
    manifests: Arc<DashMap<String, FileManifest>>,
    uploads: Arc<UploadManager>,
    downloads: Arc<DownloadManager>,
    repair: Arc<RepairEngine>,
    repair_tx: mpsc::UnboundedSender<RepairSignal>,
    rpc: Arc<NodeRpc>,
    /// Chunks reported by nodes that no committed file or live upload knows;
    /// evicted from their node once they outlive the grace period.
    stale_chunks: Mutex<HashMap<(String, ChunkKey), Instant>>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    health_events: Mutex<Option<mpsc::UnboundedReceiver<HealthEvent>>>,
    repair_signals: Mutex<Option<mpsc::UnboundedReceiver<RepairSignal>>>,
}

impl CoordinatorService {
    /// Bind the coordinator's listen socket and wire up every subsystem.
    pub async fn bind(
        config: ClusterConfig,
        listen_host: &str,
        listen_port: u16,
    ) -> CoordinatorResult<Arc<Self>> {
        let listener = TcpListener::bind((listen_host, listen_port)).await?;
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(NodeRegistry::new());
        let index = Arc::new(ReplicaIndex::new());
        let manifests: Arc<DashMap<String, FileManifest>> = Arc::new(DashMap::new());
        let rpc = Arc::new(NodeRpc::new(&config.network));
        let policy = Arc::new(PlacementPolicy::new(Strategy::from_name(
            &config.replication.placement_strategy,
        )));

        let (monitor, health_events) = HeartbeatMonitor::new(
            config.monitor.failure_timeout,
            config.monitor.tick_interval,
        );
        let monitor = Arc::new(monitor);

        let (repair, repair_signals) = RepairEngine::new(
            config.repair.clone(),
            registry.clone(),
            monitor.clone(),
            index.clone(),
            rpc.clone(),
            policy.clone(),
            manifests.clone(),
        );
        let repair_tx = repair.signal_sender();

        let uploads = Arc::new(UploadManager::new(
            config.chunking.clone(),
            config.replication.clone(),
            config.upload.clone(),
            registry.clone(),
            monitor.clone(),
            index.clone(),
            rpc.clone(),
            PlacementPolicy::new(Strategy::from_name(&config.replication.placement_strategy)),
            manifests.clone(),
        ));

        let downloads = Arc::new(DownloadManager::new(
            registry.clone(),
            monitor.clone(),
            index.clone(),
            rpc.clone(),
            repair_tx.clone(),
        ));

        info!(addr = %local_addr, "coordinator bound");

        Ok(Arc::new(Self {
            config,
            registry,
            monitor,
            index,
            manifests,
            uploads,
            downloads,
            repair,
            repair_tx,
            rpc,
            stale_chunks: Mutex::new(HashMap::new()),
            listener: Mutex::new(Some(listener)),
            local_addr,
            health_events: Mutex::new(Some(health_events)),
            repair_signals: Mutex::new(Some(repair_signals)),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn replica_index(&self) -> &Arc<ReplicaIndex> {
        &self.index
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Operator hook: force a repair sweep outside the timer.
    pub fn trigger_repair_sweep(&self) {
        let _ = self.repair_tx.send(RepairSignal::Admin);
    }

    /// Run the service: the accept loop plus the named background tasks.
    /// Returns once shutdown flips and the loops have wound down.
    pub async fn run(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> CoordinatorResult<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .expect("CoordinatorService::run called twice");

        let health_events = self
            .health_events
            .lock()
            .take()
            .expect("health event receiver already taken");
        let repair_signals = self
            .repair_signals
            .lock()
            .take()
            .expect("repair signal receiver already taken");

        // heartbeat monitor tick loop
        let monitor = self.monitor.clone();
        let monitor_shutdown = shutdown.clone();
        let monitor_task = tokio::spawn(async move {
            monitor.run(monitor_shutdown).await;
        });

        // failure/recovery event consumer
        let service = self.clone();
        let events_shutdown = shutdown.clone();
        let events_task = tokio::spawn(async move {
            service.run_event_loop(health_events, events_shutdown).await;
        });

        // re-replication engine
        let repair = self.repair.clone();
        let repair_shutdown = shutdown.clone();
        let repair_task = tokio::spawn(async move {
            repair.run(repair_signals, repair_shutdown).await;
        });

        // stale chunk + stale upload garbage collection
        let service = self.clone();
        let gc_shutdown = shutdown.clone();
        let gc_task = tokio::spawn(async move {
            service.run_gc_loop(gc_shutdown).await;
        });

        let mut shutdown_rx = shutdown;
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let service = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = service.handle_connection(stream).await {
                                    debug!(peer = %peer, error = %e, "connection ended with error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("coordinator shutting down");
        let _ = tokio::join!(monitor_task, events_task, repair_task, gc_task);
        Ok(())
    }

    /// React to monitor verdicts: a FAILED node's replicas leave the index
    /// immediately, then the repair engine takes over.
    async fn run_event_loop(
        &self,
        mut events: mpsc::UnboundedReceiver<HealthEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(HealthEvent::NodeFailed { node_id }) => {
                            self.registry.set_lifecycle(&node_id, NodeLifecycle::Failed);
                            let dropped = self.index.drop_node(&node_id);
                            metrics::record_node_failure(&node_id);
                            warn!(
                                node_id,
                                chunks_affected = dropped.len(),
                                "node failed; replicas dropped from index"
                            );
                            let _ = self.repair_tx.send(RepairSignal::NodeFailed { node_id });
                        }
                        Some(HealthEvent::NodeRecovered { node_id }) => {
                            self.registry.set_lifecycle(&node_id, NodeLifecycle::Healthy);
                            info!(node_id, "node recovered; awaiting chunk reconciliation");
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn run_gc_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let tick = (self.config.monitor.gc_grace / 3).max(Duration::from_millis(100));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.collect_stale_chunks().await;
                    self.collect_stale_uploads().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn collect_stale_chunks(&self) {
        let grace = self.config.monitor.gc_grace;
        let due: Vec<(String, ChunkKey)> = {
            let candidates = self.stale_chunks.lock();
            candidates
                .iter()
                .filter(|(_, first_seen)| first_seen.elapsed() > grace)
                .map(|(key, _)| key.clone())
                .collect()
        };

        for (node_id, key) in due {
            self.stale_chunks.lock().remove(&(node_id.clone(), key.clone()));

            // the copy may have become load-bearing since it was flagged
            if self.index.holds(&key, &node_id) || self.uploads.is_session_active(&key.file_id) {
                continue;
            }
            if let Some(manifest) = self.manifests.get(&key.file_id) {
                if self.index.replica_count(&key) < manifest.replication_factor {
                    continue;
                }
            }
            let Some(addr) = self.registry.addr_of(&node_id) else {
                continue;
            };
            info!(chunk = %key, node_id = %node_id, "garbage-collecting stale chunk");
            if let Err(e) = self.rpc.delete_chunk(addr, &key).await {
                debug!(chunk = %key, node_id = %node_id, error = %e, "stale chunk delete failed");
            }
        }
    }

    async fn collect_stale_uploads(&self) {
        for file_id in self
            .uploads
            .expired_sessions(self.config.upload.session_timeout)
        {
            warn!(file_id = %file_id, "upload session expired, collecting");
            self.uploads.abort(&file_id).await;
        }
    }

    async fn handle_connection(self: &Arc<Self>, mut stream: TcpStream) -> CoordinatorResult<()> {
        loop {
            let frame = match wire::read_frame(&mut stream).await {
                Ok(frame) => frame,
                Err(wire::WireError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            match frame.kind {
                kind::REGISTER => self.handle_register(&mut stream, &frame).await?,
                kind::HEARTBEAT => self.handle_heartbeat(&mut stream, &frame).await?,
                kind::DEREGISTER => self.handle_deregister(&mut stream, &frame).await?,
                kind::UPLOAD_BEGIN => self.handle_upload_begin(&mut stream, &frame).await?,
                kind::UPLOAD_CHUNK => self.handle_upload_chunk(&mut stream, &frame).await?,
                kind::UPLOAD_COMMIT => self.handle_upload_commit(&mut stream, &frame).await?,
                kind::DOWNLOAD => self.handle_download(&mut stream, &frame).await?,
                kind::STATUS => self.handle_status(&mut stream).await?,
                kind::PING => wire::write_message(&mut stream, kind::OK, &()).await?,
                other => {
                    warn!(kind = other, "unknown message kind");
                    send_error(
                        &mut stream,
                        &CoordinatorError::InvalidRequest(format!(
                            "unknown message kind {other:#04x}"
                        )),
                    )
                    .await?;
                }
            }
        }
    }

    async fn handle_register(&self, stream: &mut TcpStream, frame: &Frame) -> CoordinatorResult<()> {
        let request: Register = frame.decode()?;
        if request.node_id.is_empty() {
            return send_error(
                stream,
                &CoordinatorError::InvalidRequest("node_id must not be empty".into()),
            )
            .await;
        }

        if let Err(reason) = self.registry.register(&request) {
            return send_error(stream, &CoordinatorError::InvalidRequest(reason)).await;
        }
        self.monitor.register(&request.node_id);
        wire::write_message(stream, kind::OK, &()).await?;
        Ok(())
    }

    async fn handle_heartbeat(
        &self,
        stream: &mut TcpStream,
        frame: &Frame,
    ) -> CoordinatorResult<()> {
        let heartbeat: Heartbeat = frame.decode()?;

        if !self.registry.apply_heartbeat(&heartbeat) {
            return send_error(
                stream,
                &CoordinatorError::UnknownNode(heartbeat.node_id.clone()),
            )
            .await;
        }

        self.monitor.observe_heartbeat(&heartbeat.node_id);
        self.reconcile_chunk_inventory(&heartbeat);
        wire::write_message(stream, kind::OK, &()).await?;
        Ok(())
    }

    /// Compare a node's reported chunk inventory with what the coordinator
    /// believes. A copy of a committed chunk still below its replication
    /// target is re-learned (a recovered node keeps useful replicas); a copy
    /// of a chunk already at target, or of a file nobody knows, becomes a GC
    /// candidate. Re-learning never pushes a chunk past its target, so
    /// `|locations| <= r` holds.
    fn reconcile_chunk_inventory(&self, heartbeat: &Heartbeat) {
        let node_id = &heartbeat.node_id;
        let mut reported: HashSet<ChunkKey> = HashSet::with_capacity(heartbeat.chunks.len());

        for chunk_ref in &heartbeat.chunks {
            let key: ChunkKey = chunk_ref.clone().into();
            reported.insert(key.clone());

            if self.index.holds(&key, node_id) {
                self.stale_chunks.lock().remove(&(node_id.clone(), key));
                continue;
            }

            let target = self
                .manifests
                .get(&key.file_id)
                .filter(|manifest| key.index < manifest.chunk_count)
                .map(|manifest| manifest.replication_factor);

            match target {
                Some(target) if self.index.replica_count(&key) < target => {
                    debug!(chunk = %key, node_id = %node_id, "re-learned replica from heartbeat");
                    self.index.register(key.clone(), node_id);
                    self.stale_chunks.lock().remove(&(node_id.clone(), key));
                }
                _ if self.uploads.is_session_active(&key.file_id) => {
                    // an in-flight upload owns this chunk; leave it alone
                }
                _ => {
                    self.stale_chunks
                        .lock()
                        .entry((node_id.clone(), key.clone()))
                        .or_insert_with(Instant::now);
                }
            }
        }

        // candidates the node no longer reports resolved themselves
        self.stale_chunks
            .lock()
            .retain(|(candidate_node, key), _| {
                candidate_node != node_id || reported.contains(key)
            });
    }

    async fn handle_deregister(
        &self,
        stream: &mut TcpStream,
        frame: &Frame,
    ) -> CoordinatorResult<()> {
        let request: Deregister = frame.decode()?;
        info!(node_id = %request.node_id, "node deregistering");

        self.registry.decommission(&request.node_id);
        self.monitor.remove(&request.node_id);
        let dropped = self.index.drop_node(&request.node_id);
        if !dropped.is_empty() {
            let _ = self.repair_tx.send(RepairSignal::Admin);
        }

        wire::write_message(stream, kind::OK, &()).await?;
        Ok(())
    }

    async fn handle_upload_begin(
        &self,
        stream: &mut TcpStream,
        frame: &Frame,
    ) -> CoordinatorResult<()> {
        let request: UploadBegin = frame.decode()?;
        match self
            .uploads
            .begin(&request.display_name, request.total_size, request.replication)
        {
            Ok(accepted) => wire::write_message(stream, kind::JSON, &accepted).await?,
            Err(e) => send_error(stream, &e).await?,
        }
        Ok(())
    }

    async fn handle_upload_chunk(
        &self,
        stream: &mut TcpStream,
        frame: &Frame,
    ) -> CoordinatorResult<()> {
        let header: UploadChunkHeader = frame.decode()?;
        // the bulk bytes are on the wire regardless of validity; always drain
        let bytes = Bytes::from(wire::read_bulk(stream, header.size).await?);

        if !is_valid_file_id(&header.file_id) {
            return send_error(
                stream,
                &CoordinatorError::InvalidRequest(format!("malformed file id {}", header.file_id)),
            )
            .await;
        }

        match self.uploads.put_chunk(&header.file_id, header.index, bytes).await {
            Ok(()) => wire::write_message(stream, kind::OK, &()).await?,
            Err(e) => send_error(stream, &e).await?,
        }
        Ok(())
    }

    async fn handle_upload_commit(
        &self,
        stream: &mut TcpStream,
        frame: &Frame,
    ) -> CoordinatorResult<()> {
        let request: UploadCommit = frame.decode()?;
        match self.uploads.commit(&request.file_id) {
            Ok(_) => wire::write_message(stream, kind::OK, &()).await?,
            Err(e) => send_error(stream, &e).await?,
        }
        Ok(())
    }

    async fn handle_download(
        &self,
        stream: &mut TcpStream,
        frame: &Frame,
    ) -> CoordinatorResult<()> {
        let request: DownloadRequest = frame.decode()?;

        if !is_valid_file_id(&request.file_id) {
            return send_error(
                stream,
                &CoordinatorError::InvalidRequest(format!(
                    "malformed file id {}",
                    request.file_id
                )),
            )
            .await;
        }
        let Some(manifest) = self.manifests.get(&request.file_id).map(|m| m.clone()) else {
            return send_error(stream, &CoordinatorError::UnknownFile(request.file_id)).await;
        };

        wire::write_message(
            stream,
            kind::JSON,
            &DownloadHeader {
                file_id: manifest.file_id.clone(),
                chunk_count: manifest.chunk_count,
                total_size: manifest.total_size,
            },
        )
        .await?;

        for index in 0..manifest.chunk_count {
            match self.downloads.fetch_chunk(&manifest, index).await {
                Ok(bytes) => {
                    let header = ChunkData {
                        index,
                        size: bytes.len() as u64,
                        checksum: checksum_to_hex(&manifest.chunk_checksums[index as usize]),
                    };
                    wire::write_message(stream, kind::CHUNK_DATA, &header).await?;
                    wire::write_bulk(stream, &bytes).await?;
                }
                Err(e) => {
                    error!(file_id = %manifest.file_id, index, error = %e, "download aborted");
                    return send_error(stream, &e).await;
                }
            }
        }

        wire::write_message(stream, kind::OK, &()).await?;
        metrics::record_download_completed(&manifest.file_id);
        Ok(())
    }

    async fn handle_status(&self, stream: &mut TcpStream) -> CoordinatorResult<()> {
        let report = StatusReport {
            total_nodes: self.registry.active_count(),
            healthy_nodes: self.monitor.healthy_count() as u64,
            total_bytes: self.registry.total_bytes(),
            used_bytes: self.registry.used_bytes(),
            file_count: self.manifests.len() as u64,
            under_replicated_count: self.repair.under_replicated_count(),
        };
        wire::write_message(stream, kind::JSON, &report).await?;
        Ok(())
    }
}

async fn send_error(stream: &mut TcpStream, error: &CoordinatorError) -> CoordinatorResult<()> {
    wire::write_message(
        stream,
        kind::ERR,
        &ErrorReply {
            category: error.category(),
            message: error.to_string(),
        },
    )
    .await?;
    Ok(())
}
