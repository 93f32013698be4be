//! The coordinator's chunk → nodes mapping.
//!
//! Two views are kept — by chunk and by node — and every write mutates both
//! under the same mutex, so they can never disagree. The mutex is only ever
//! held for map operations; callers drop it before issuing any RPC.

use crate::store::ChunkKey;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// A chunk whose replica count sits below the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnderReplicated {
    pub key: ChunkKey,
    pub current: u32,
}

#[derive(Default)]
struct IndexInner {
    by_chunk: HashMap<ChunkKey, HashSet<String>>,
    by_node: HashMap<String, HashSet<ChunkKey>>,
}

#[derive(Default)]
pub struct ReplicaIndex {
    inner: Mutex<IndexInner>,
}

impl ReplicaIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `node_id` holds an acknowledged replica of `key`.
    pub fn register(&self, key: ChunkKey, node_id: &str) {
        let mut inner = self.inner.lock();
        inner
            .by_chunk
            .entry(key.clone())
            .or_default()
            .insert(node_id.to_string());
        inner
            .by_node
            .entry(node_id.to_string())
            .or_default()
            .insert(key);
    }

    /// Remove one replica. Unknown pairs are a no-op.
    pub fn unregister(&self, key: &ChunkKey, node_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(nodes) = inner.by_chunk.get_mut(key) {
            nodes.remove(node_id);
            if nodes.is_empty() {
                inner.by_chunk.remove(key);
            }
        }
        if let Some(chunks) = inner.by_node.get_mut(node_id) {
            chunks.remove(key);
            if chunks.is_empty() {
                inner.by_node.remove(node_id);
            }
        }
    }

    /// Remove every chunk record of a file (upload abort, file delete).
    /// Returns the replicas that were dropped, per node, so the caller can
    /// schedule the on-node deletions.
    pub fn unregister_file(&self, file_id: &str) -> Vec<(ChunkKey, String)> {
        let mut inner = self.inner.lock();
        let keys: Vec<ChunkKey> = inner
            .by_chunk
            .keys()
            .filter(|k| k.file_id == file_id)
            .cloned()
            .collect();

        let mut dropped = Vec::new();
        for key in keys {
            if let Some(nodes) = inner.by_chunk.remove(&key) {
                for node_id in nodes {
                    if let Some(chunks) = inner.by_node.get_mut(&node_id) {
                        chunks.remove(&key);
                        if chunks.is_empty() {
                            inner.by_node.remove(&node_id);
                        }
                    }
                    dropped.push((key.clone(), node_id));
                }
            }
        }
        dropped
    }

    /// Drop every replica record of a node in one atomic sweep (failure
    /// handling). Returns the chunks the node was holding.
    pub fn drop_node(&self, node_id: &str) -> Vec<ChunkKey> {
        let mut inner = self.inner.lock();
        let Some(chunks) = inner.by_node.remove(node_id) else {
            return Vec::new();
        };

        let mut affected: Vec<ChunkKey> = Vec::with_capacity(chunks.len());
        for key in chunks {
            if let Some(nodes) = inner.by_chunk.get_mut(&key) {
                nodes.remove(node_id);
                if nodes.is_empty() {
                    inner.by_chunk.remove(&key);
                }
            }
            affected.push(key);
        }
        affected.sort();
        affected
    }

    pub fn locations(&self, key: &ChunkKey) -> HashSet<String> {
        self.inner
            .lock()
            .by_chunk
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn replica_count(&self, key: &ChunkKey) -> u32 {
        self.inner
            .lock()
            .by_chunk
            .get(key)
            .map(|nodes| nodes.len() as u32)
            .unwrap_or(0)
    }

    pub fn chunks_on(&self, node_id: &str) -> Vec<ChunkKey> {
        let inner = self.inner.lock();
        let mut chunks: Vec<ChunkKey> = inner
            .by_node
            .get(node_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        chunks.sort();
        chunks
    }

    pub fn holds(&self, key: &ChunkKey, node_id: &str) -> bool {
        self.inner
            .lock()
            .by_chunk
            .get(key)
            .map(|nodes| nodes.contains(node_id))
            .unwrap_or(false)
    }

    /// Every chunk whose replica count is below `target`, with its current
    /// count.
    pub fn under_replicated(&self, target: u32) -> Vec<UnderReplicated> {
        let inner = self.inner.lock();
        let mut entries: Vec<UnderReplicated> = inner
            .by_chunk
            .iter()
            .filter(|(_, nodes)| (nodes.len() as u32) < target)
            .map(|(key, nodes)| UnderReplicated {
                key: key.clone(),
                current: nodes.len() as u32,
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.lock().by_chunk.len()
    }
}
