//! The monitor task that drives the health table against the real clock.

use crate::monitor::health::{HealthEvent, HealthTable, NodeHealth};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Receives heartbeats, classifies nodes, and publishes failure/recovery
/// events on an internal channel for the repair engine to consume.
pub struct HeartbeatMonitor {
    table: Arc<Mutex<HealthTable>>,
    events_tx: mpsc::UnboundedSender<HealthEvent>,
    tick_interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        failure_timeout: Duration,
        tick_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<HealthEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let monitor = Self {
            table: Arc::new(Mutex::new(HealthTable::new(failure_timeout))),
            events_tx,
            tick_interval,
        };
        (monitor, events_rx)
    }

    /// Seed a node as HEALTHY on registration.
    pub fn register(&self, node_id: &str) {
        self.table.lock().register(node_id, Instant::now());
        debug!(node_id, "node registered with monitor");
    }

    /// Drop a node from monitoring (decommission).
    pub fn remove(&self, node_id: &str) {
        self.table.lock().remove(node_id);
    }

    /// Record an incoming heartbeat; publishes the recovery event if the
    /// node was FAILED.
    pub fn observe_heartbeat(&self, node_id: &str) {
        let event = self.table.lock().observe(node_id, Instant::now());
        if let Some(event) = event {
            info!(node_id, "node recovered");
            let _ = self.events_tx.send(event);
        }
    }

    pub fn is_healthy(&self, node_id: &str) -> bool {
        self.table.lock().is_healthy(node_id)
    }

    pub fn health(&self, node_id: &str) -> Option<NodeHealth> {
        self.table.lock().health(node_id)
    }

    pub fn healthy_nodes(&self) -> Vec<String> {
        self.table.lock().healthy_nodes()
    }

    pub fn healthy_count(&self) -> usize {
        self.table.lock().healthy_nodes().len()
    }

    /// Tick loop. Runs until the shutdown flag flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(tick = ?self.tick_interval, "heartbeat monitor started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let events = self.table.lock().tick(Instant::now());
                    for event in events {
                        if let HealthEvent::NodeFailed { node_id } = &event {
                            warn!(node_id, "node failure detected");
                        }
                        let _ = self.events_tx.send(event);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("heartbeat monitor stopping");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failure_event_published_after_timeout() {
        let (monitor, mut events_rx) =
            HeartbeatMonitor::new(Duration::from_millis(50), Duration::from_millis(10));
        monitor.register("node-1");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = Arc::new(monitor);
        let runner = monitor.clone();
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("timed out waiting for failure event")
            .unwrap();
        assert_eq!(
            event,
            HealthEvent::NodeFailed {
                node_id: "node-1".into()
            }
        );
        assert!(!monitor.is_healthy("node-1"));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn heartbeats_keep_node_healthy() {
        let (monitor, mut events_rx) =
            HeartbeatMonitor::new(Duration::from_millis(100), Duration::from_millis(10));
        monitor.register("node-1");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = Arc::new(monitor);
        let runner = monitor.clone();
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            monitor.observe_heartbeat("node-1");
        }
        assert!(monitor.is_healthy("node-1"));
        assert!(events_rx.try_recv().is_err());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn recovery_event_published_on_new_beat() {
        let (monitor, mut events_rx) =
            HeartbeatMonitor::new(Duration::from_millis(30), Duration::from_millis(10));
        monitor.register("node-1");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = Arc::new(monitor);
        let runner = monitor.clone();
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

        let failed = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(failed, HealthEvent::NodeFailed { .. }));

        tokio::time::sleep(Duration::from_millis(5)).await;
        monitor.observe_heartbeat("node-1");

        let recovered = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(recovered, HealthEvent::NodeRecovered { .. }));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
