//! In-memory chunk storage for one node.

use crate::integrity::{Checksum, IntegrityVerifier};
use crate::store::error::{StoreError, StoreResult};
use crate::store::types::ChunkKey;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;

struct StoredChunk {
    bytes: Bytes,
    checksum: Checksum,
}

struct StoreInner {
    chunks: HashMap<ChunkKey, StoredChunk>,
    used_bytes: u64,
}

/// Chunk bytes keyed by `(file_id, index)`, verified on put and bounded by a
/// fixed capacity. All state sits behind one mutex; a rejected put leaves no
/// trace, so a half-written chunk is never observable.
pub struct ChunkStore {
    inner: Mutex<StoreInner>,
    capacity: u64,
    verify_on_read: bool,
}

impl ChunkStore {
    pub fn new(capacity: u64, verify_on_read: bool) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                chunks: HashMap::new(),
                used_bytes: 0,
            }),
            capacity,
            verify_on_read,
        }
    }

    /// Store a chunk after recomputing its checksum from the received bytes.
    ///
    /// A re-put of an identical chunk is an idempotent success; a re-put with
    /// a different checksum is a hard error.
    pub fn put(&self, key: ChunkKey, bytes: Bytes, expected: &Checksum) -> StoreResult<()> {
        if IntegrityVerifier::verify(&bytes, expected).is_err() {
            return Err(StoreError::WrongChecksum { key });
        }

        let size = bytes.len() as u64;
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.chunks.get(&key) {
            if &existing.checksum == expected {
                return Ok(());
            }
            return Err(StoreError::AlreadyPresent { key });
        }

        let available = self.capacity - inner.used_bytes;
        if size > available {
            return Err(StoreError::OutOfCapacity {
                key,
                needed: size,
                available,
            });
        }

        inner.chunks.insert(
            key,
            StoredChunk {
                bytes,
                checksum: *expected,
            },
        );
        inner.used_bytes += size;
        Ok(())
    }

    /// Fetch a chunk, re-verifying the stored bytes when configured to.
    pub fn get(&self, key: &ChunkKey) -> StoreResult<Bytes> {
        let inner = self.inner.lock();
        let stored = inner
            .chunks
            .get(key)
            .ok_or_else(|| StoreError::Missing { key: key.clone() })?;

        if self.verify_on_read
            && IntegrityVerifier::verify(&stored.bytes, &stored.checksum).is_err()
        {
            return Err(StoreError::CorruptOnRead { key: key.clone() });
        }

        Ok(stored.bytes.clone())
    }

    /// Drop a chunk and release its bytes from the usage ledger.
    pub fn delete(&self, key: &ChunkKey) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        let removed = inner
            .chunks
            .remove(key)
            .ok_or_else(|| StoreError::Missing { key: key.clone() })?;

        let freed = removed.bytes.len() as u64;
        inner.used_bytes -= freed;
        Ok(freed)
    }

    pub fn list(&self) -> Vec<(ChunkKey, u64)> {
        let inner = self.inner.lock();
        let mut entries: Vec<_> = inner
            .chunks
            .iter()
            .map(|(key, chunk)| (key.clone(), chunk.bytes.len() as u64))
            .collect();
        entries.sort();
        entries
    }

    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.inner.lock().chunks.contains_key(key)
    }

    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().used_bytes
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn free_bytes(&self) -> u64 {
        let inner = self.inner.lock();
        self.capacity - inner.used_bytes
    }

    /// Failure-injection hook: flip one bit of a stored chunk's bytes without
    /// touching its recorded checksum, so the next verified read fails.
    pub fn corrupt_stored_bytes(&self, key: &ChunkKey) -> bool {
        let mut inner = self.inner.lock();
        match inner.chunks.get_mut(key) {
            Some(stored) if !stored.bytes.is_empty() => {
                let mut bytes = stored.bytes.to_vec();
                bytes[0] ^= 0x01;
                stored.bytes = Bytes::from(bytes);
                true
            }
            _ => false,
        }
    }
}
