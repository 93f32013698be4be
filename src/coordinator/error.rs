use crate::store::ChunkKey;
use crate::wire::ErrorCategory;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("wire error: {0}")]
    Wire(#[from] crate::wire::WireError),

    #[error("placement error: {0}")]
    Placement(#[from] crate::placement::PlacementError),

    #[error("integrity error: {0}")]
    Integrity(#[from] crate::integrity::IntegrityError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rpc to {addr} exceeded its deadline")]
    RpcTimeout { addr: std::net::SocketAddr },

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("unknown file: {0}")]
    UnknownFile(String),

    #[error("no active upload for file {0}")]
    UploadNotFound(String),

    #[error("upload of {file_id} incomplete: {missing} chunks never arrived")]
    UploadIncomplete { file_id: String, missing: u32 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("cannot place {needed} replicas for {file_id}: {available} candidates")]
    InsufficientReplicas {
        file_id: String,
        needed: u32,
        available: u32,
    },

    #[error("no reachable replica for chunk {key}")]
    ChunkUnavailable { key: ChunkKey },
}

impl CoordinatorError {
    /// Behavioural category reported over the wire.
    pub fn category(&self) -> ErrorCategory {
        match self {
            CoordinatorError::InvalidRequest(_)
            | CoordinatorError::UnknownFile(_)
            | CoordinatorError::UnknownNode(_)
            | CoordinatorError::UploadNotFound(_)
            | CoordinatorError::UploadIncomplete { .. } => ErrorCategory::Validation,
            CoordinatorError::InsufficientReplicas { .. } | CoordinatorError::Placement(_) => {
                ErrorCategory::Capacity
            }
            CoordinatorError::Integrity(_) => ErrorCategory::Integrity,
            CoordinatorError::ChunkUnavailable { .. } => ErrorCategory::Liveness,
            CoordinatorError::Wire(crate::wire::WireError::Remote { category, .. }) => *category,
            CoordinatorError::Wire(_)
            | CoordinatorError::Io(_)
            | CoordinatorError::RpcTimeout { .. } => ErrorCategory::Transport,
        }
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
