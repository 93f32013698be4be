//! Thin client for the coordinator's wire protocol.

use crate::client::error::{ClientError, ClientResult};
use crate::integrity::{checksum_from_hex, IntegrityVerifier};
use crate::wire::{
    self, kind, ChunkData, DownloadHeader, DownloadRequest, ErrorReply, StatusReport, UploadAccepted,
    UploadBegin, UploadChunkHeader, UploadCommit, WireError,
};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::{debug, info};

pub struct ClusterClient {
    coordinator_addr: SocketAddr,
}

impl ClusterClient {
    pub fn new(coordinator_addr: SocketAddr) -> Self {
        Self { coordinator_addr }
    }

    /// Upload a file; returns the assigned file id once the manifest has
    /// committed.
    pub async fn upload(
        &self,
        display_name: &str,
        data: &[u8],
        replication: u32,
    ) -> ClientResult<String> {
        if data.is_empty() {
            return Err(ClientError::EmptyFile);
        }

        let mut stream = TcpStream::connect(self.coordinator_addr).await?;

        wire::write_message(
            &mut stream,
            kind::UPLOAD_BEGIN,
            &UploadBegin {
                display_name: display_name.to_string(),
                total_size: data.len() as u64,
                replication,
            },
        )
        .await?;
        let accepted: UploadAccepted = expect_json(&mut stream).await?;
        debug!(
            file_id = %accepted.file_id,
            chunk_size = accepted.chunk_size,
            "upload accepted"
        );

        for (index, chunk) in data.chunks(accepted.chunk_size as usize).enumerate() {
            wire::write_message(
                &mut stream,
                kind::UPLOAD_CHUNK,
                &UploadChunkHeader {
                    file_id: accepted.file_id.clone(),
                    index: index as u32,
                    size: chunk.len() as u64,
                },
            )
            .await?;
            wire::write_bulk(&mut stream, chunk).await?;
            expect_ok(&mut stream).await?;
        }

        wire::write_message(
            &mut stream,
            kind::UPLOAD_COMMIT,
            &UploadCommit {
                file_id: accepted.file_id.clone(),
            },
        )
        .await?;
        expect_ok(&mut stream).await?;

        info!(file_id = %accepted.file_id, bytes = data.len(), "upload complete");
        Ok(accepted.file_id)
    }

    /// Download a file, verifying every chunk against the checksums the
    /// coordinator streams alongside the bytes.
    pub async fn download(&self, file_id: &str) -> ClientResult<Vec<u8>> {
        let mut stream = TcpStream::connect(self.coordinator_addr).await?;

        wire::write_message(
            &mut stream,
            kind::DOWNLOAD,
            &DownloadRequest {
                file_id: file_id.to_string(),
            },
        )
        .await?;
        let header: DownloadHeader = expect_json(&mut stream).await?;

        let mut data = Vec::with_capacity(header.total_size as usize);
        for expected_index in 0..header.chunk_count {
            let frame = wire::read_frame(&mut stream).await?;
            match frame.kind {
                kind::CHUNK_DATA => {
                    let chunk: ChunkData = frame.decode()?;
                    if chunk.index != expected_index {
                        return Err(ClientError::OutOfOrderChunk {
                            expected: expected_index,
                            got: chunk.index,
                        });
                    }
                    let bytes = wire::read_bulk(&mut stream, chunk.size).await?;
                    let checksum = checksum_from_hex(&chunk.checksum)?;
                    IntegrityVerifier::verify(&bytes, &checksum)?;
                    data.extend_from_slice(&bytes);
                }
                kind::ERR => {
                    let err: ErrorReply = frame.decode()?;
                    return Err(WireError::Remote {
                        category: err.category,
                        message: err.message,
                    }
                    .into());
                }
                other => {
                    return Err(WireError::UnexpectedKind {
                        expected: kind::CHUNK_DATA,
                        got: other,
                    }
                    .into());
                }
            }
        }

        // the stream ends with an explicit OK
        expect_ok(&mut stream).await?;
        info!(file_id, bytes = data.len(), "download complete");
        Ok(data)
    }

    pub async fn status(&self) -> ClientResult<StatusReport> {
        let mut stream = TcpStream::connect(self.coordinator_addr).await?;
        wire::write_message(&mut stream, kind::STATUS, &()).await?;
        expect_json(&mut stream).await
    }
}

async fn expect_ok(stream: &mut TcpStream) -> ClientResult<()> {
    let frame = wire::read_frame(stream).await?;
    match frame.kind {
        kind::OK => Ok(()),
        kind::ERR => {
            let err: ErrorReply = frame.decode()?;
            Err(WireError::Remote {
                category: err.category,
                message: err.message,
            }
            .into())
        }
        other => Err(WireError::UnexpectedKind {
            expected: kind::OK,
            got: other,
        }
        .into()),
    }
}

async fn expect_json<T: serde::de::DeserializeOwned>(stream: &mut TcpStream) -> ClientResult<T> {
    let frame = wire::read_frame(stream).await?;
    match frame.kind {
        kind::JSON => Ok(frame.decode()?),
        kind::ERR => {
            let err: ErrorReply = frame.decode()?;
            Err(WireError::Remote {
                category: err.category,
                message: err.message,
            }
            .into())
        }
        other => Err(WireError::UnexpectedKind {
            expected: kind::JSON,
            got: other,
        }
        .into()),
    }
}
