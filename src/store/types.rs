use crate::wire::ChunkRef;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one chunk: the owning file plus its dense zero-based index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub file_id: String,
    pub index: u32,
}

impl ChunkKey {
    pub fn new(file_id: impl Into<String>, index: u32) -> Self {
        Self {
            file_id: file_id.into(),
            index,
        }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.index)
    }
}

impl From<ChunkRef> for ChunkKey {
    fn from(r: ChunkRef) -> Self {
        Self {
            file_id: r.file_id,
            index: r.index,
        }
    }
}

impl From<&ChunkKey> for ChunkRef {
    fn from(k: &ChunkKey) -> Self {
        Self {
            file_id: k.file_id.clone(),
            index: k.index,
        }
    }
}
