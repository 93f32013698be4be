//! Node health classification.
//!
//! The table is a pure function of the heartbeat timestamps and the clock
//! values passed in: replaying the same sequence of `register` / `observe` /
//! `tick` calls produces the same decisions. The caller supplies every
//! `Instant`, which is what makes replay testable.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    Healthy,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    NodeFailed { node_id: String },
    NodeRecovered { node_id: String },
}

struct NodeRecord {
    last_seen: Instant,
    health: NodeHealth,
}

pub struct HealthTable {
    nodes: HashMap<String, NodeRecord>,
    failure_timeout: Duration,
}

impl HealthTable {
    pub fn new(failure_timeout: Duration) -> Self {
        Self {
            nodes: HashMap::new(),
            failure_timeout,
        }
    }

    /// Seed a freshly registered node as HEALTHY with `last_seen = now`.
    pub fn register(&mut self, node_id: impl Into<String>, now: Instant) {
        self.nodes.insert(
            node_id.into(),
            NodeRecord {
                last_seen: now,
                health: NodeHealth::Healthy,
            },
        );
    }

    /// Forget a node entirely (decommission).
    pub fn remove(&mut self, node_id: &str) {
        self.nodes.remove(node_id);
    }

    /// Record a heartbeat. Returns the recovery event when it flips a FAILED
    /// node back to HEALTHY. A heartbeat always wins against a concurrent
    /// failure tick: it is applied on arrival, so the next `tick` sees the
    /// fresh timestamp.
    pub fn observe(&mut self, node_id: &str, at: Instant) -> Option<HealthEvent> {
        let record = self.nodes.get_mut(node_id)?;

        if at <= record.last_seen {
            // stale or duplicate beat; never moves the clock backwards
            return None;
        }
        record.last_seen = at;

        if record.health == NodeHealth::Failed {
            record.health = NodeHealth::Healthy;
            return Some(HealthEvent::NodeRecovered {
                node_id: node_id.to_string(),
            });
        }
        None
    }

    /// Evaluate every node against the failure timeout, returning the
    /// transitions that fired.
    pub fn tick(&mut self, now: Instant) -> Vec<HealthEvent> {
        let mut events = Vec::new();

        for (node_id, record) in self.nodes.iter_mut() {
            if record.health == NodeHealth::Healthy
                && now.duration_since(record.last_seen) > self.failure_timeout
            {
                record.health = NodeHealth::Failed;
                events.push(HealthEvent::NodeFailed {
                    node_id: node_id.clone(),
                });
            }
        }

        events
    }

    pub fn health(&self, node_id: &str) -> Option<NodeHealth> {
        self.nodes.get(node_id).map(|r| r.health)
    }

    pub fn is_healthy(&self, node_id: &str) -> bool {
        self.health(node_id) == Some(NodeHealth::Healthy)
    }

    pub fn healthy_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<_> = self
            .nodes
            .iter()
            .filter(|(_, r)| r.health == NodeHealth::Healthy)
            .map(|(id, _)| id.clone())
            .collect();
        nodes.sort();
        nodes
    }

    pub fn failed_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<_> = self
            .nodes
            .iter()
            .filter(|(_, r)| r.health == NodeHealth::Failed)
            .map(|(id, _)| id.clone())
            .collect();
        nodes.sort();
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[test]
    fn registration_seeds_healthy() {
        let mut table = HealthTable::new(TIMEOUT);
        let now = Instant::now();

        table.register("node-1", now);
        assert_eq!(table.health("node-1"), Some(NodeHealth::Healthy));
        assert!(table.tick(now).is_empty());
    }

    #[test]
    fn silence_past_timeout_fails_node() {
        let mut table = HealthTable::new(TIMEOUT);
        let start = Instant::now();
        table.register("node-1", start);

        // just inside the window: no event
        assert!(table.tick(start + TIMEOUT).is_empty());

        let events = table.tick(start + TIMEOUT + Duration::from_secs(1));
        assert_eq!(
            events,
            vec![HealthEvent::NodeFailed {
                node_id: "node-1".into()
            }]
        );
        // a second tick must not re-fire
        assert!(table
            .tick(start + TIMEOUT + Duration::from_secs(2))
            .is_empty());
    }

    #[test]
    fn newer_heartbeat_recovers_failed_node() {
        let mut table = HealthTable::new(TIMEOUT);
        let start = Instant::now();
        table.register("node-1", start);
        table.tick(start + TIMEOUT + Duration::from_secs(1));
        assert_eq!(table.health("node-1"), Some(NodeHealth::Failed));

        let event = table.observe("node-1", start + TIMEOUT + Duration::from_secs(2));
        assert_eq!(
            event,
            Some(HealthEvent::NodeRecovered {
                node_id: "node-1".into()
            })
        );
        assert_eq!(table.health("node-1"), Some(NodeHealth::Healthy));
    }

    #[test]
    fn stale_heartbeat_does_not_recover() {
        let mut table = HealthTable::new(TIMEOUT);
        let start = Instant::now();
        table.register("node-1", start);
        table.tick(start + TIMEOUT + Duration::from_secs(1));

        // timestamp not newer than the recorded one
        assert!(table.observe("node-1", start).is_none());
        assert_eq!(table.health("node-1"), Some(NodeHealth::Failed));
    }

    #[test]
    fn heartbeat_wins_same_instant_race() {
        let mut table = HealthTable::new(TIMEOUT);
        let start = Instant::now();
        table.register("node-1", start);

        // beat lands just before the tick evaluates the same deadline
        let deadline = start + TIMEOUT + Duration::from_secs(1);
        table.observe("node-1", deadline);
        assert!(table.tick(deadline).is_empty());
        assert_eq!(table.health("node-1"), Some(NodeHealth::Healthy));
    }

    #[test]
    fn replay_is_deterministic() {
        let start = Instant::now();
        let beats: Vec<(&str, Duration)> = vec![
            ("a", Duration::from_secs(1)),
            ("b", Duration::from_secs(2)),
            ("a", Duration::from_secs(20)),
            ("a", Duration::from_secs(45)),
        ];
        let ticks: Vec<Duration> = (0..60).map(Duration::from_secs).collect();

        let run = || {
            let mut table = HealthTable::new(TIMEOUT);
            table.register("a", start);
            table.register("b", start);

            let mut log = Vec::new();
            let mut next_beat = 0;
            for offset in &ticks {
                let now = start + *offset;
                while next_beat < beats.len() && beats[next_beat].1 <= *offset {
                    let (node, at) = &beats[next_beat];
                    if let Some(event) = table.observe(node, start + *at) {
                        log.push(event);
                    }
                    next_beat += 1;
                }
                log.extend(table.tick(now));
            }
            log
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn cycles_any_number_of_times() {
        let mut table = HealthTable::new(TIMEOUT);
        let start = Instant::now();
        table.register("node-1", start);

        let mut now = start;
        for round in 0..3 {
            now += TIMEOUT + Duration::from_secs(1);
            let failed = table.tick(now);
            assert_eq!(failed.len(), 1, "round {round}");

            now += Duration::from_secs(1);
            let recovered = table.observe("node-1", now);
            assert!(recovered.is_some(), "round {round}");
        }
    }
}
