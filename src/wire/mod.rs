pub mod error;
pub mod frame;
pub mod messages;

pub use error::{WireError, WireResult};
pub use frame::{read_bulk, read_frame, write_bulk, write_frame, write_message, Frame};
pub use messages::{
    kind, ChunkData, ChunkRef, Deregister, DownloadHeader, DownloadRequest, ErrorCategory,
    ErrorReply, GetChunk, Heartbeat, PutChunkHeader, Register, StatusReport, UploadAccepted,
    UploadBegin, UploadChunkHeader, UploadCommit,
};
