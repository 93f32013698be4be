use crate::store::types::ChunkKey;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("chunk {key} rejected: checksum of received bytes does not match")]
    WrongChecksum { key: ChunkKey },

    #[error("chunk {key} rejected: {needed} bytes needed, {available} available")]
    OutOfCapacity {
        key: ChunkKey,
        needed: u64,
        available: u64,
    },

    #[error("chunk {key} already present with a different checksum")]
    AlreadyPresent { key: ChunkKey },

    #[error("chunk {key} not stored here")]
    Missing { key: ChunkKey },

    #[error("chunk {key} failed verification on read")]
    CorruptOnRead { key: ChunkKey },

    #[error("link saturated: no bandwidth available for {key}")]
    LinkSaturated { key: ChunkKey },
}

pub type StoreResult<T> = Result<T, StoreError>;
