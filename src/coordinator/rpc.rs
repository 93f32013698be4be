//! Framed RPCs from the coordinator to storage nodes.
//!
//! Transport failures are retried with jittered exponential backoff inside a
//! single logical RPC; anything still failing after the budget surfaces to
//! the caller as a per-replica failure. Every attempt runs under the
//! end-to-end deadline.

use crate::config::NetworkConfig;
use crate::coordinator::error::{CoordinatorError, CoordinatorResult};
use crate::integrity::{checksum_to_hex, Checksum};
use crate::store::ChunkKey;
use crate::wire::{
    self, kind, ChunkData, ErrorCategory, ErrorReply, GetChunk, PutChunkHeader, WireError,
};
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

pub struct NodeRpc {
    timeout: Duration,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl NodeRpc {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            timeout: config.rpc_timeout,
            retry_attempts: config.retry_attempts,
            retry_delay: config.retry_delay,
        }
    }

    /// Store one chunk on a node, verified there against `checksum`.
    pub async fn put_chunk(
        &self,
        addr: SocketAddr,
        key: &ChunkKey,
        bytes: &Bytes,
        checksum: &Checksum,
    ) -> CoordinatorResult<()> {
        let header = PutChunkHeader {
            file_id: key.file_id.clone(),
            index: key.index,
            size: bytes.len() as u64,
            checksum: checksum_to_hex(checksum),
        };

        self.with_retry(addr, || async {
            let mut stream = TcpStream::connect(addr).await.map_err(WireError::from)?;
            wire::write_message(&mut stream, kind::PUT_CHUNK, &header).await?;
            wire::write_bulk(&mut stream, bytes).await?;
            expect_ok(&mut stream).await
        })
        .await
    }

    /// Fetch one chunk's bytes from a node.
    pub async fn get_chunk(&self, addr: SocketAddr, key: &ChunkKey) -> CoordinatorResult<Bytes> {
        let request = GetChunk {
            file_id: key.file_id.clone(),
            index: key.index,
        };

        self.with_retry(addr, || async {
            let mut stream = TcpStream::connect(addr).await.map_err(WireError::from)?;
            wire::write_message(&mut stream, kind::GET_CHUNK, &request).await?;

            let frame = wire::read_frame(&mut stream).await?;
            match frame.kind {
                kind::CHUNK_DATA => {
                    let header: ChunkData = frame.decode()?;
                    let bytes = wire::read_bulk(&mut stream, header.size).await?;
                    Ok(Bytes::from(bytes))
                }
                kind::ERR => {
                    let err: ErrorReply = frame.decode()?;
                    Err(WireError::Remote {
                        category: err.category,
                        message: err.message,
                    })
                }
                other => Err(WireError::UnexpectedKind {
                    expected: kind::CHUNK_DATA,
                    got: other,
                }),
            }
        })
        .await
    }

    /// Remove one chunk from a node.
    pub async fn delete_chunk(&self, addr: SocketAddr, key: &ChunkKey) -> CoordinatorResult<()> {
        let request = GetChunk {
            file_id: key.file_id.clone(),
            index: key.index,
        };

        self.with_retry(addr, || async {
            let mut stream = TcpStream::connect(addr).await.map_err(WireError::from)?;
            wire::write_message(&mut stream, kind::DELETE_CHUNK, &request).await?;
            expect_ok(&mut stream).await
        })
        .await
    }

    pub async fn ping(&self, addr: SocketAddr) -> CoordinatorResult<()> {
        self.with_retry(addr, || async {
            let mut stream = TcpStream::connect(addr).await.map_err(WireError::from)?;
            wire::write_message(&mut stream, kind::PING, &()).await?;
            expect_ok(&mut stream).await
        })
        .await
    }

    async fn with_retry<T, F, Fut>(&self, addr: SocketAddr, attempt: F) -> CoordinatorResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, WireError>>,
    {
        let mut delay = self.retry_delay;
        let budget = self.retry_attempts.max(1);

        for round in 0..budget {
            let outcome = tokio::time::timeout(self.timeout, attempt()).await;

            let error = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    if !is_retryable(&e) {
                        return Err(e.into());
                    }
                    CoordinatorError::Wire(e)
                }
                Err(_) => CoordinatorError::RpcTimeout { addr },
            };

            if round + 1 == budget {
                return Err(error);
            }

            debug!(addr = %addr, error = %error, round, "rpc attempt failed, backing off");
            let jitter = Duration::from_millis(rand::random::<u64>() % 50);
            tokio::time::sleep(delay + jitter).await;
            delay = (delay * 2).min(Duration::from_millis(1200));
        }

        unreachable!("retry loop always returns")
    }
}

async fn expect_ok(stream: &mut TcpStream) -> Result<(), WireError> {
    let frame = wire::read_frame(stream).await?;
    match frame.kind {
        kind::OK => Ok(()),
        kind::ERR => {
            let err: ErrorReply = frame.decode()?;
            Err(WireError::Remote {
                category: err.category,
                message: err.message,
            })
        }
        other => Err(WireError::UnexpectedKind {
            expected: kind::OK,
            got: other,
        }),
    }
}

/// Transport-category failures are worth another attempt; everything else
/// (checksum rejections, capacity, validation) will fail the same way again.
fn is_retryable(error: &WireError) -> bool {
    match error {
        WireError::Io(_) | WireError::ConnectionClosed => true,
        WireError::Remote { category, .. } => *category == ErrorCategory::Transport,
        _ => false,
    }
}
