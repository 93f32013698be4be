//! Replica placement strategies.

use crate::placement::error::{PlacementError, PlacementResult};
use rand::seq::SliceRandom;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use tracing::warn;

/// What placement needs to know about a candidate node.
#[derive(Debug, Clone)]
pub struct NodeView {
    pub node_id: String,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Free-bytes order interleaved by a node-id hash stride, to break the
    /// clustering that pure free-space ordering produces.
    Diverse,
    /// Pure free-bytes descending.
    LeastLoaded,
    /// Uniform sample.
    Random,
}

impl Strategy {
    /// Parse a configured strategy name, falling back to `Diverse`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "diverse" => Strategy::Diverse,
            "least_loaded" => Strategy::LeastLoaded,
            "random" => Strategy::Random,
            other => {
                warn!(strategy = other, "unknown placement strategy, using diverse");
                Strategy::Diverse
            }
        }
    }
}

pub struct PlacementPolicy {
    strategy: Strategy,
}

impl PlacementPolicy {
    pub fn new(strategy: Strategy) -> Self {
        Self { strategy }
    }

    /// Choose `k` target nodes among `candidates`, skipping excluded nodes
    /// and nodes without `min_free_bytes` to spare. A short result surfaces
    /// as `InsufficientCandidates` carrying the nodes that did qualify.
    pub fn select(
        &self,
        candidates: &[NodeView],
        k: usize,
        exclude: &HashSet<String>,
        min_free_bytes: u64,
    ) -> PlacementResult<Vec<String>> {
        let mut qualifying: Vec<&NodeView> = candidates
            .iter()
            .filter(|node| !exclude.contains(&node.node_id))
            .filter(|node| node.free_bytes >= min_free_bytes)
            .collect();

        if qualifying.len() < k {
            let mut available: Vec<String> =
                qualifying.iter().map(|n| n.node_id.clone()).collect();
            available.sort();
            return Err(PlacementError::InsufficientCandidates {
                available,
                wanted: k,
            });
        }

        let selected = match self.strategy {
            Strategy::Random => qualifying
                .choose_multiple(&mut rand::thread_rng(), k)
                .map(|n| n.node_id.clone())
                .collect(),
            Strategy::LeastLoaded => {
                sort_by_free_space(&mut qualifying);
                qualifying[..k].iter().map(|n| n.node_id.clone()).collect()
            }
            Strategy::Diverse => {
                sort_by_free_space(&mut qualifying);
                stride_pick(&qualifying, k)
            }
        };

        Ok(selected)
    }
}

/// Free bytes descending, node-id hash as the deterministic tie-break.
fn sort_by_free_space(nodes: &mut [&NodeView]) {
    nodes.sort_by(|a, b| {
        b.free_bytes
            .cmp(&a.free_bytes)
            .then_with(|| id_hash(&a.node_id).cmp(&id_hash(&b.node_id)))
    });
}

/// Take every `len / k`-th node first, then fill from the front. Spreads the
/// selection across the sorted range instead of clustering on the emptiest
/// nodes.
fn stride_pick(sorted: &[&NodeView], k: usize) -> Vec<String> {
    let step = (sorted.len() / k).max(1);
    let mut selected: Vec<String> = Vec::with_capacity(k);

    let mut position = 0;
    while position < sorted.len() && selected.len() < k {
        selected.push(sorted[position].node_id.clone());
        position += step;
    }
    for node in sorted {
        if selected.len() >= k {
            break;
        }
        if !selected.contains(&node.node_id) {
            selected.push(node.node_id.clone());
        }
    }

    selected
}

fn id_hash(node_id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    node_id.hash(&mut hasher);
    hasher.finish()
}
