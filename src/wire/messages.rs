//! Message payloads exchanged between coordinator, nodes, and clients.
//!
//! All string fields are UTF-8 and checksums travel as lowercase hex SHA-256.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Message kind bytes. 0x0x are node→coordinator control, 0x1x are
/// coordinator→node chunk operations, 0x2x/0x3x/0x4x are client RPCs, and
/// 0x8x are replies.
pub mod kind {
    pub const REGISTER: u8 = 0x01;
    pub const HEARTBEAT: u8 = 0x02;
    pub const DEREGISTER: u8 = 0x03;

    pub const PUT_CHUNK: u8 = 0x10;
    pub const GET_CHUNK: u8 = 0x11;
    pub const PING: u8 = 0x12;
    pub const DELETE_CHUNK: u8 = 0x13;

    pub const UPLOAD_BEGIN: u8 = 0x20;
    pub const UPLOAD_CHUNK: u8 = 0x21;
    pub const UPLOAD_COMMIT: u8 = 0x22;

    pub const DOWNLOAD: u8 = 0x30;

    pub const STATUS: u8 = 0x40;

    pub const OK: u8 = 0x81;
    pub const ERR: u8 = 0x82;
    pub const CHUNK_DATA: u8 = 0x83;
    pub const JSON: u8 = 0x84;
}

/// Behavioural error category, mirrored on both sides of the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Capacity,
    Integrity,
    Transport,
    Liveness,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Capacity => "capacity",
            ErrorCategory::Integrity => "integrity",
            ErrorCategory::Transport => "transport",
            ErrorCategory::Liveness => "liveness",
            ErrorCategory::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub category: ErrorCategory,
    pub message: String,
}

/// `(file_id, chunk_index)` as it appears in heartbeat chunk inventories.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRef {
    pub file_id: String,
    pub index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Register {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub capacity: u64,
    pub bandwidth: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    pub used_bytes: u64,
    pub utilisation: f64,
    pub chunks: Vec<ChunkRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deregister {
    pub node_id: String,
}

/// Header preceding the raw bytes of a chunk put.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutChunkHeader {
    pub file_id: String,
    pub index: u32,
    pub size: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetChunk {
    pub file_id: String,
    pub index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadBegin {
    pub display_name: String,
    pub total_size: u64,
    pub replication: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadAccepted {
    pub file_id: String,
    pub chunk_size: u64,
}

/// Header preceding the raw bytes of one uploaded chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunkHeader {
    pub file_id: String,
    pub index: u32,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadCommit {
    pub file_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub file_id: String,
}

/// Announces the chunk stream that follows a download request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadHeader {
    pub file_id: String,
    pub chunk_count: u32,
    pub total_size: u64,
}

/// Header preceding the raw bytes of one streamed chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkData {
    pub index: u32,
    pub size: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub total_nodes: u64,
    pub healthy_nodes: u64,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub file_count: u64,
    pub under_replicated_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_category_serialises_snake_case() {
        let raw = serde_json::to_string(&ErrorCategory::Capacity).unwrap();
        assert_eq!(raw, "\"capacity\"");

        let parsed: ErrorCategory = serde_json::from_str("\"liveness\"").unwrap();
        assert_eq!(parsed, ErrorCategory::Liveness);
    }

    #[test]
    fn heartbeat_payload_shape() {
        let hb = Heartbeat {
            node_id: "node-1".into(),
            used_bytes: 4096,
            utilisation: 1_500_000.0,
            chunks: vec![ChunkRef {
                file_id: "deadbeef".into(),
                index: 0,
            }],
        };

        let value: serde_json::Value = serde_json::to_value(&hb).unwrap();
        assert_eq!(value["node_id"], "node-1");
        assert_eq!(value["chunks"][0]["index"], 0);
    }
}
