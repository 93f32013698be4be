//! Heartbeat emission.
//!
//! Every interval the node reports its identity, usage, utilisation, and the
//! full chunk inventory. A missed emission is simply dropped; the monitor
//! infers liveness from timing, so there is nothing to retry.

use crate::node::server::StorageNode;
use crate::wire::{self, kind, Heartbeat};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info};

pub async fn run(node: Arc<StorageNode>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(node.config().heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(
        node_id = %node.node_id(),
        interval = ?node.config().heartbeat_interval,
        "heartbeat emitter started"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = emit(&node).await {
                    debug!(node_id = %node.node_id(), error = %e, "heartbeat dropped");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn emit(node: &StorageNode) -> crate::node::NodeResult<()> {
    let snapshot = node.metrics_snapshot();
    let chunks = node
        .chunk_store()
        .list()
        .iter()
        .map(|(key, _)| key.into())
        .collect();

    let mut stream = TcpStream::connect(node.config().coordinator_addr).await?;
    wire::write_message(
        &mut stream,
        kind::HEARTBEAT,
        &Heartbeat {
            node_id: snapshot.node_id,
            used_bytes: snapshot.used_bytes,
            utilisation: snapshot.utilisation_bps,
            chunks,
        },
    )
    .await?;
    wire::read_frame(&mut stream).await?;
    Ok(())
}
