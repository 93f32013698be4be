use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("malformed checksum string: {0}")]
    MalformedChecksum(String),
}

pub type IntegrityResult<T> = Result<T, IntegrityError>;
