//! The storage node server: chunk put/get/delete plus liveness plumbing.

use crate::integrity::checksum_from_hex;
use crate::metrics;
use crate::node::error::{NodeError, NodeResult};
use crate::node::heartbeat;
use crate::node::types::{NodeConfig, NodeMetricsSnapshot};
use crate::store::{
    BandwidthAccountant, ChunkKey, ChunkStore, ReservationKey, StoreError, TransferDirection,
};
use crate::wire::{
    self, kind, ChunkData, Deregister, ErrorCategory, ErrorReply, Frame, GetChunk, PutChunkHeader,
    Register,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// One storage node: an accept loop, a chunk store, and a bandwidth ledger.
pub struct StorageNode {
    config: NodeConfig,
    store: Arc<ChunkStore>,
    bandwidth: Arc<BandwidthAccountant>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    transfers_completed: AtomicU64,
    started_at: Instant,
}

impl StorageNode {
    /// Bind the listen socket. Port 0 picks an ephemeral port; the resolved
    /// address is what gets advertised to the coordinator.
    pub async fn bind(config: NodeConfig) -> NodeResult<Arc<Self>> {
        let listener =
            TcpListener::bind((config.listen_host.as_str(), config.listen_port)).await?;
        let local_addr = listener.local_addr()?;

        info!(
            node_id = %config.node_id,
            addr = %local_addr,
            capacity = config.capacity_bytes,
            "storage node bound"
        );

        Ok(Arc::new(Self {
            store: Arc::new(ChunkStore::new(config.capacity_bytes, config.verify_on_read)),
            bandwidth: Arc::new(BandwidthAccountant::new(config.bandwidth_bps)),
            listener: Mutex::new(Some(listener)),
            local_addr,
            transfers_completed: AtomicU64::new(0),
            started_at: Instant::now(),
            config,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Direct access to the chunk store, used by the heartbeat emitter and
    /// by failure-injection in tests.
    pub fn chunk_store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn bandwidth(&self) -> &Arc<BandwidthAccountant> {
        &self.bandwidth
    }

    /// Read-only resource snapshot; recomputed from the store and the
    /// bandwidth ledger every time.
    pub fn metrics_snapshot(&self) -> NodeMetricsSnapshot {
        NodeMetricsSnapshot {
            node_id: self.config.node_id.clone(),
            used_bytes: self.store.used_bytes(),
            capacity_bytes: self.store.capacity(),
            utilisation_bps: self.bandwidth.utilisation(),
            bandwidth_bps: self.config.bandwidth_bps,
            chunks_stored: self.store.chunk_count(),
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Announce this node to the coordinator.
    pub async fn register(&self) -> NodeResult<()> {
        let mut stream = TcpStream::connect(self.config.coordinator_addr).await?;
        wire::write_message(
            &mut stream,
            kind::REGISTER,
            &Register {
                node_id: self.config.node_id.clone(),
                host: self.local_addr.ip().to_string(),
                port: self.local_addr.port(),
                capacity: self.config.capacity_bytes,
                bandwidth: self.config.bandwidth_bps,
            },
        )
        .await?;

        let reply = wire::read_frame(&mut stream).await?;
        match reply.kind {
            kind::OK => {
                info!(node_id = %self.config.node_id, "registered with coordinator");
                Ok(())
            }
            kind::ERR => {
                let err: ErrorReply = reply.decode()?;
                Err(NodeError::RegistrationRejected(err.message))
            }
            other => Err(NodeError::Wire(wire::WireError::UnexpectedKind {
                expected: kind::OK,
                got: other,
            })),
        }
    }

    /// Serve requests until shutdown, then drain and deregister.
    pub async fn run(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> NodeResult<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .expect("StorageNode::run called twice");

        let heartbeat_node = self.clone();
        let heartbeat_shutdown = shutdown.clone();
        let heartbeat_handle = tokio::spawn(async move {
            heartbeat::run(heartbeat_node, heartbeat_shutdown).await;
        });

        let mut shutdown_rx = shutdown;
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let node = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = node.handle_connection(stream).await {
                                    debug!(peer = %peer, error = %e, "connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!(node_id = %self.config.node_id, "storage node shutting down");
        let _ = heartbeat_handle.await;
        self.deregister().await;
        Ok(())
    }

    /// Best-effort goodbye; a lost message just means the coordinator times
    /// the node out instead.
    async fn deregister(&self) {
        let result = async {
            let mut stream = TcpStream::connect(self.config.coordinator_addr).await?;
            wire::write_message(
                &mut stream,
                kind::DEREGISTER,
                &Deregister {
                    node_id: self.config.node_id.clone(),
                },
            )
            .await?;
            wire::read_frame(&mut stream).await?;
            Ok::<(), NodeError>(())
        }
        .await;

        if let Err(e) = result {
            warn!(node_id = %self.config.node_id, error = %e, "deregistration failed");
        }
    }

    async fn handle_connection(self: &Arc<Self>, mut stream: TcpStream) -> NodeResult<()> {
        loop {
            let frame = match wire::read_frame(&mut stream).await {
                Ok(frame) => frame,
                Err(wire::WireError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            match frame.kind {
                kind::PUT_CHUNK => self.handle_put(&mut stream, &frame).await?,
                kind::GET_CHUNK => self.handle_get(&mut stream, &frame).await?,
                kind::DELETE_CHUNK => self.handle_delete(&mut stream, &frame).await?,
                kind::PING => wire::write_message(&mut stream, kind::OK, &()).await?,
                other => {
                    warn!(kind = other, "unknown message kind");
                    send_error(
                        &mut stream,
                        ErrorCategory::Validation,
                        format!("unknown message kind {other:#04x}"),
                    )
                    .await?;
                }
            }
        }
    }

    async fn handle_put(self: &Arc<Self>, stream: &mut TcpStream, frame: &Frame) -> NodeResult<()> {
        let header: PutChunkHeader = frame.decode()?;
        let key = ChunkKey::new(header.file_id.clone(), header.index);

        let expected = match checksum_from_hex(&header.checksum) {
            Ok(checksum) => checksum,
            Err(e) => {
                // the bulk bytes are already on the wire; drain them so the
                // connection stays usable
                let _ = wire::read_bulk(stream, header.size).await?;
                return send_error(stream, ErrorCategory::Validation, e.to_string()).await;
            }
        };

        let bytes = Bytes::from(wire::read_bulk(stream, header.size).await?);

        let reservation = ReservationKey::new(key.clone(), TransferDirection::Inbound);
        let granted = match self
            .bandwidth
            .reserve(reservation.clone(), self.config.bandwidth_bps as f64)
        {
            Ok(granted) => granted,
            Err(e) => {
                return send_error(stream, ErrorCategory::Transport, e.to_string()).await;
            }
        };

        // model the wire: transmission time plus fixed latency
        self.sleep_transfer_time(bytes.len(), granted).await;

        let result = self.store.put(key.clone(), bytes, &expected);
        self.bandwidth.release(&reservation);

        match result {
            Ok(()) => {
                self.transfers_completed.fetch_add(1, Ordering::Relaxed);
                metrics::record_chunk_stored(header.size);
                debug!(chunk = %key, size = header.size, "chunk stored");
                wire::write_message(stream, kind::OK, &()).await?;
            }
            Err(e) => {
                warn!(chunk = %key, error = %e, "put rejected");
                send_error(stream, store_error_category(&e), e.to_string()).await?;
            }
        }
        Ok(())
    }

    async fn handle_get(self: &Arc<Self>, stream: &mut TcpStream, frame: &Frame) -> NodeResult<()> {
        let request: GetChunk = frame.decode()?;
        let key = ChunkKey::new(request.file_id.clone(), request.index);

        let bytes = match self.store.get(&key) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(chunk = %key, error = %e, "get failed");
                return send_error(stream, store_error_category(&e), e.to_string()).await;
            }
        };

        let reservation = ReservationKey::new(key.clone(), TransferDirection::Outbound);
        let granted = match self
            .bandwidth
            .reserve(reservation.clone(), self.config.bandwidth_bps as f64)
        {
            Ok(granted) => granted,
            Err(e) => {
                return send_error(stream, ErrorCategory::Transport, e.to_string()).await;
            }
        };

        self.sleep_transfer_time(bytes.len(), granted).await;

        let checksum = crate::integrity::IntegrityVerifier::calculate_checksum(&bytes);
        let header = ChunkData {
            index: key.index,
            size: bytes.len() as u64,
            checksum: crate::integrity::checksum_to_hex(&checksum),
        };
        let send_result = async {
            wire::write_message(stream, kind::CHUNK_DATA, &header).await?;
            wire::write_bulk(stream, &bytes).await
        }
        .await;
        self.bandwidth.release(&reservation);
        send_result?;

        self.transfers_completed.fetch_add(1, Ordering::Relaxed);
        metrics::record_chunk_served(bytes.len() as u64);
        Ok(())
    }

    async fn handle_delete(
        self: &Arc<Self>,
        stream: &mut TcpStream,
        frame: &Frame,
    ) -> NodeResult<()> {
        let request: GetChunk = frame.decode()?;
        let key = ChunkKey::new(request.file_id.clone(), request.index);

        match self.store.delete(&key) {
            Ok(freed) => {
                debug!(chunk = %key, freed, "chunk deleted");
                wire::write_message(stream, kind::OK, &()).await?;
            }
            Err(e) => {
                send_error(stream, store_error_category(&e), e.to_string()).await?;
            }
        }
        Ok(())
    }

    async fn sleep_transfer_time(&self, size_bytes: usize, granted_bps: f64) {
        let bits = (size_bytes as f64) * 8.0;
        let seconds = bits / granted_bps;
        tokio::time::sleep(Duration::from_secs_f64(seconds) + self.config.base_latency).await;
    }
}

fn store_error_category(error: &StoreError) -> ErrorCategory {
    match error {
        StoreError::WrongChecksum { .. }
        | StoreError::AlreadyPresent { .. }
        | StoreError::CorruptOnRead { .. } => ErrorCategory::Integrity,
        StoreError::OutOfCapacity { .. } => ErrorCategory::Capacity,
        StoreError::Missing { .. } => ErrorCategory::Validation,
        StoreError::LinkSaturated { .. } => ErrorCategory::Transport,
    }
}

async fn send_error(
    stream: &mut TcpStream,
    category: ErrorCategory,
    message: String,
) -> NodeResult<()> {
    wire::write_message(stream, kind::ERR, &ErrorReply { category, message }).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::{checksum_to_hex, IntegrityVerifier};

    async fn test_node() -> Arc<StorageNode> {
        // coordinator address is never dialled in these tests
        let config = NodeConfig::builder("test-node", "127.0.0.1:1".parse().unwrap())
            .capacity_bytes(1024 * 1024)
            .bandwidth_bps(1_000_000_000)
            .base_latency(Duration::from_millis(0))
            .build();
        StorageNode::bind(config).await.unwrap()
    }

    async fn spawn_node(node: Arc<StorageNode>) -> watch::Sender<bool> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = node.listener.lock().take().unwrap();

        // accept loop without the heartbeat task (no coordinator in these tests)
        tokio::spawn(async move {
            let mut shutdown = shutdown_rx;
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        if let Ok((stream, _)) = accepted {
                            let node = node.clone();
                            tokio::spawn(async move {
                                let _ = node.handle_connection(stream).await;
                            });
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        shutdown_tx
    }

    async fn put_chunk(
        addr: SocketAddr,
        file_id: &str,
        index: u32,
        bytes: &[u8],
        checksum: &str,
    ) -> Frame {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        wire::write_message(
            &mut stream,
            kind::PUT_CHUNK,
            &PutChunkHeader {
                file_id: file_id.into(),
                index,
                size: bytes.len() as u64,
                checksum: checksum.into(),
            },
        )
        .await
        .unwrap();
        wire::write_bulk(&mut stream, bytes).await.unwrap();
        wire::read_frame(&mut stream).await.unwrap()
    }

    #[tokio::test]
    async fn put_then_get_round_trip() {
        let node = test_node().await;
        let addr = node.local_addr();
        let _shutdown = spawn_node(node.clone()).await;

        let data = b"some chunk bytes";
        let checksum = checksum_to_hex(&IntegrityVerifier::calculate_checksum(data));

        let reply = put_chunk(addr, "file-1", 0, data, &checksum).await;
        assert_eq!(reply.kind, kind::OK);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        wire::write_message(
            &mut stream,
            kind::GET_CHUNK,
            &GetChunk {
                file_id: "file-1".into(),
                index: 0,
            },
        )
        .await
        .unwrap();

        let frame = wire::read_frame(&mut stream).await.unwrap();
        assert_eq!(frame.kind, kind::CHUNK_DATA);
        let header: ChunkData = frame.decode().unwrap();
        assert_eq!(header.size, data.len() as u64);
        assert_eq!(header.checksum, checksum);

        let bytes = wire::read_bulk(&mut stream, header.size).await.unwrap();
        assert_eq!(bytes, data);
    }

    #[tokio::test]
    async fn wrong_checksum_rejected_over_wire() {
        let node = test_node().await;
        let addr = node.local_addr();
        let _shutdown = spawn_node(node.clone()).await;

        let bogus = checksum_to_hex(&IntegrityVerifier::calculate_checksum(b"other data"));
        let reply = put_chunk(addr, "file-1", 0, b"actual data", &bogus).await;

        assert_eq!(reply.kind, kind::ERR);
        let err: ErrorReply = reply.decode().unwrap();
        assert_eq!(err.category, ErrorCategory::Integrity);
        assert_eq!(node.chunk_store().chunk_count(), 0);
    }

    #[tokio::test]
    async fn missing_chunk_reported() {
        let node = test_node().await;
        let addr = node.local_addr();
        let _shutdown = spawn_node(node.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        wire::write_message(
            &mut stream,
            kind::GET_CHUNK,
            &GetChunk {
                file_id: "ghost".into(),
                index: 0,
            },
        )
        .await
        .unwrap();

        let frame = wire::read_frame(&mut stream).await.unwrap();
        assert_eq!(frame.kind, kind::ERR);
    }

    #[tokio::test]
    async fn utilisation_returns_to_zero_after_concurrent_puts() {
        let node = test_node().await;
        let addr = node.local_addr();
        let _shutdown = spawn_node(node.clone()).await;

        let mut handles = Vec::new();
        for index in 0..10u32 {
            let data = vec![index as u8; 8 * 1024];
            let checksum = checksum_to_hex(&IntegrityVerifier::calculate_checksum(&data));
            handles.push(tokio::spawn(async move {
                put_chunk(addr, "bulk-file", index, &data, &checksum).await
            }));
        }
        for handle in handles {
            let reply = handle.await.unwrap();
            assert_eq!(reply.kind, kind::OK);
        }

        assert_eq!(node.bandwidth().utilisation(), 0.0);
        assert_eq!(node.chunk_store().chunk_count(), 10);
    }

    #[tokio::test]
    async fn metrics_snapshot_is_read_only() {
        let node = test_node().await;
        let addr = node.local_addr();
        let _shutdown = spawn_node(node.clone()).await;

        let data = b"metrics payload";
        let checksum = checksum_to_hex(&IntegrityVerifier::calculate_checksum(data));
        put_chunk(addr, "file-1", 0, data, &checksum).await;

        let first = node.metrics_snapshot();
        let second = node.metrics_snapshot();
        assert_eq!(first.used_bytes, second.used_bytes);
        assert_eq!(first.chunks_stored, 1);
        assert_eq!(first.utilisation_bps, 0.0);
    }
}
