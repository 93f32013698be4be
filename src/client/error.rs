use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("wire error: {0}")]
    Wire(#[from] crate::wire::WireError),

    #[error("integrity error: {0}")]
    Integrity(#[from] crate::integrity::IntegrityError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("refusing to upload an empty file")]
    EmptyFile,

    #[error("server sent chunk {got}, expected {expected}")]
    OutOfOrderChunk { expected: u32, got: u32 },
}

pub type ClientResult<T> = Result<T, ClientError>;
