use crate::wire::messages::ErrorCategory;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame length {0} exceeds the {max} limit", max = crate::wire::frame::MAX_FRAME_BYTES)]
    FrameTooLarge(usize),

    #[error("bulk payload of {0} bytes exceeds the {max} limit", max = crate::wire::frame::MAX_BULK_BYTES)]
    BulkTooLarge(u64),

    #[error("unexpected message kind {got:#04x}, expected {expected:#04x}")]
    UnexpectedKind { expected: u8, got: u8 },

    #[error("peer reported {category} error: {message}")]
    Remote {
        category: ErrorCategory,
        message: String,
    },

    #[error("connection closed mid-frame")]
    ConnectionClosed,
}

pub type WireResult<T> = Result<T, WireError>;
