//! Length-prefixed framing over TCP.
//!
//! Each frame is a 4-byte big-endian length covering the kind byte plus the
//! JSON payload, then the kind, then the payload. Bulk chunk bytes are not
//! framed: they follow the frame raw, with their size declared in the JSON
//! header that precedes them.

use crate::wire::error::{WireError, WireResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Control frames are small JSON documents; anything bigger is a bug.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Upper bound on a single chunk's raw bytes.
pub const MAX_BULK_BYTES: u64 = 64 * 1024 * 1024;

/// One decoded control frame.
#[derive(Debug)]
pub struct Frame {
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Deserialize the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> WireResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Read one frame, or `ConnectionClosed` on clean EOF before the length.
pub async fn read_frame<S>(stream: &mut S) -> WireResult<Frame>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;

    let kind = body[0];
    let payload = body.split_off(1);
    Ok(Frame { kind, payload })
}

/// Write one frame from pre-encoded payload bytes.
pub async fn write_frame<S>(stream: &mut S, kind: u8, payload: &[u8]) -> WireResult<()>
where
    S: AsyncWrite + Unpin,
{
    let len = payload.len() + 1;
    if len > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge(len));
    }

    stream.write_all(&(len as u32).to_be_bytes()).await?;
    stream.write_all(&[kind]).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Serialize `message` as JSON and write it as one frame.
pub async fn write_message<S, T>(stream: &mut S, kind: u8, message: &T) -> WireResult<()>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    write_frame(stream, kind, &payload).await
}

/// Read exactly `size` raw bytes following a frame.
pub async fn read_bulk<S>(stream: &mut S, size: u64) -> WireResult<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    if size > MAX_BULK_BYTES {
        return Err(WireError::BulkTooLarge(size));
    }

    let mut buf = vec![0u8; size as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write raw chunk bytes following a frame.
pub async fn write_bulk<S>(stream: &mut S, bytes: &[u8]) -> WireResult<()>
where
    S: AsyncWrite + Unpin,
{
    if bytes.len() as u64 > MAX_BULK_BYTES {
        return Err(WireError::BulkTooLarge(bytes.len() as u64));
    }

    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}
