//! The coordinator's view of the node population.

use crate::coordinator::types::{NodeDescriptor, NodeLifecycle};
use crate::placement::NodeView;
use crate::wire::{Heartbeat, Register};
use dashmap::DashMap;
use std::net::SocketAddr;
use tracing::{info, warn};

#[derive(Debug, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// First time this node id was seen.
    New,
    /// Same id, same endpoint: idempotent re-registration.
    Refreshed,
    /// Same id, different endpoint: the old entry was decommissioned.
    Replaced,
}

#[derive(Default)]
pub struct NodeRegistry {
    nodes: DashMap<String, NodeDescriptor>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request: &Register) -> Result<RegistrationOutcome, String> {
        let addr: SocketAddr = match format!("{}:{}", request.host, request.port).parse() {
            Ok(addr) => addr,
            Err(_) => {
                warn!(node_id = %request.node_id, host = %request.host, "unparseable endpoint");
                return Err(format!(
                    "unparseable endpoint {}:{}",
                    request.host, request.port
                ));
            }
        };

        let descriptor = NodeDescriptor {
            node_id: request.node_id.clone(),
            addr,
            capacity_bytes: request.capacity,
            bandwidth_bps: request.bandwidth,
            lifecycle: NodeLifecycle::Healthy,
            used_bytes: 0,
            utilisation_bps: 0.0,
            chunks_stored: 0,
        };

        let outcome = match self.nodes.insert(request.node_id.clone(), descriptor) {
            None => {
                info!(node_id = %request.node_id, addr = %addr, "node registered");
                RegistrationOutcome::New
            }
            Some(previous) if previous.addr == addr => RegistrationOutcome::Refreshed,
            Some(previous) => {
                info!(
                    node_id = %request.node_id,
                    old_addr = %previous.addr,
                    new_addr = %addr,
                    "node re-registered from a new endpoint; old entry decommissioned"
                );
                RegistrationOutcome::Replaced
            }
        };
        Ok(outcome)
    }

    pub fn decommission(&self, node_id: &str) {
        if let Some(mut entry) = self.nodes.get_mut(node_id) {
            entry.lifecycle = NodeLifecycle::Decommissioned;
            info!(node_id, "node decommissioned");
        }
    }

    pub fn set_lifecycle(&self, node_id: &str, lifecycle: NodeLifecycle) {
        if let Some(mut entry) = self.nodes.get_mut(node_id) {
            entry.lifecycle = lifecycle;
        }
    }

    /// Fold a heartbeat's resource snapshot into the descriptor.
    pub fn apply_heartbeat(&self, heartbeat: &Heartbeat) -> bool {
        match self.nodes.get_mut(&heartbeat.node_id) {
            Some(mut entry) => {
                entry.used_bytes = heartbeat.used_bytes;
                entry.utilisation_bps = heartbeat.utilisation;
                entry.chunks_stored = heartbeat.chunks.len() as u64;
                true
            }
            None => false,
        }
    }

    pub fn addr_of(&self, node_id: &str) -> Option<SocketAddr> {
        self.nodes.get(node_id).map(|entry| entry.addr)
    }

    pub fn descriptor(&self, node_id: &str) -> Option<NodeDescriptor> {
        self.nodes.get(node_id).map(|entry| entry.clone())
    }

    pub fn utilisation_of(&self, node_id: &str) -> f64 {
        self.nodes
            .get(node_id)
            .map(|entry| entry.utilisation_bps)
            .unwrap_or(f64::MAX)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Placement views for the given node ids (normally the healthy set).
    pub fn views(&self, node_ids: &[String]) -> Vec<NodeView> {
        node_ids
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|entry| entry.lifecycle == NodeLifecycle::Healthy)
            .map(|entry| NodeView {
                node_id: entry.node_id.clone(),
                free_bytes: entry.free_bytes(),
            })
            .collect()
    }

    /// Active (non-decommissioned) node count.
    pub fn active_count(&self) -> u64 {
        self.nodes
            .iter()
            .filter(|entry| entry.lifecycle != NodeLifecycle::Decommissioned)
            .count() as u64
    }

    /// Sum of declared capacities across active nodes.
    pub fn total_bytes(&self) -> u64 {
        self.nodes
            .iter()
            .filter(|entry| entry.lifecycle != NodeLifecycle::Decommissioned)
            .map(|entry| entry.capacity_bytes)
            .sum()
    }

    /// Sum of last-reported usage across active nodes.
    pub fn used_bytes(&self) -> u64 {
        self.nodes
            .iter()
            .filter(|entry| entry.lifecycle != NodeLifecycle::Decommissioned)
            .map(|entry| entry.used_bytes)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ChunkRef;

    fn register_request(node_id: &str, port: u16) -> Register {
        Register {
            node_id: node_id.into(),
            host: "127.0.0.1".into(),
            port,
            capacity: 1000,
            bandwidth: 1_000_000,
        }
    }

    #[test]
    fn fresh_registration() {
        let registry = NodeRegistry::new();
        let outcome = registry.register(&register_request("node-1", 9000)).unwrap();
        assert_eq!(outcome, RegistrationOutcome::New);
        assert!(registry.contains("node-1"));
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn same_endpoint_is_idempotent() {
        let registry = NodeRegistry::new();
        registry.register(&register_request("node-1", 9000)).unwrap();
        let outcome = registry.register(&register_request("node-1", 9000)).unwrap();
        assert_eq!(outcome, RegistrationOutcome::Refreshed);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn endpoint_change_replaces_entry() {
        let registry = NodeRegistry::new();
        registry.register(&register_request("node-1", 9000)).unwrap();
        let outcome = registry.register(&register_request("node-1", 9001)).unwrap();
        assert_eq!(outcome, RegistrationOutcome::Replaced);
        assert_eq!(registry.addr_of("node-1").unwrap().port(), 9001);
    }

    #[test]
    fn heartbeat_updates_snapshot() {
        let registry = NodeRegistry::new();
        registry.register(&register_request("node-1", 9000)).unwrap();

        let applied = registry.apply_heartbeat(&Heartbeat {
            node_id: "node-1".into(),
            used_bytes: 400,
            utilisation: 123.0,
            chunks: vec![ChunkRef {
                file_id: "f".into(),
                index: 0,
            }],
        });
        assert!(applied);

        let descriptor = registry.descriptor("node-1").unwrap();
        assert_eq!(descriptor.used_bytes, 400);
        assert_eq!(descriptor.free_bytes(), 600);
        assert_eq!(descriptor.chunks_stored, 1);
    }

    #[test]
    fn heartbeat_from_unknown_node_reports_false() {
        let registry = NodeRegistry::new();
        let applied = registry.apply_heartbeat(&Heartbeat {
            node_id: "ghost".into(),
            used_bytes: 0,
            utilisation: 0.0,
            chunks: vec![],
        });
        assert!(!applied);
    }

    #[test]
    fn decommissioned_nodes_leave_the_totals() {
        let registry = NodeRegistry::new();
        registry.register(&register_request("node-1", 9000)).unwrap();
        registry.register(&register_request("node-2", 9001)).unwrap();
        assert_eq!(registry.total_bytes(), 2000);

        registry.decommission("node-2");
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.total_bytes(), 1000);
        assert!(registry.views(&["node-2".into()]).is_empty());
    }
}
