//! Cluster metrics recorded through the `metrics` facade.
//!
//! Binaries decide whether anything listens; the library just records.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use std::sync::atomic::{AtomicBool, Ordering};

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Register metric descriptions (call once at startup).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    describe_counter!(
        "chunkgrid_chunks_stored_total",
        "Chunks accepted by storage nodes"
    );
    describe_counter!(
        "chunkgrid_chunks_served_total",
        "Chunks read back from storage nodes"
    );
    describe_counter!("chunkgrid_bytes_stored_total", "Bytes accepted by nodes");
    describe_counter!("chunkgrid_bytes_served_total", "Bytes read back from nodes");

    describe_counter!("chunkgrid_uploads_total", "Uploads committed");
    describe_counter!("chunkgrid_uploads_failed_total", "Uploads aborted");
    describe_counter!("chunkgrid_downloads_total", "Downloads completed");

    describe_counter!("chunkgrid_repairs_started_total", "Repair tasks started");
    describe_counter!(
        "chunkgrid_repairs_completed_total",
        "Repair tasks that restored a replica"
    );
    describe_counter!("chunkgrid_repairs_failed_total", "Repair tasks given up on");
    describe_counter!(
        "chunkgrid_node_failures_total",
        "Nodes declared FAILED by the monitor"
    );

    describe_gauge!(
        "chunkgrid_under_replicated_chunks",
        "Chunks currently below their replication target"
    );
}

pub fn record_chunk_stored(size: u64) {
    counter!("chunkgrid_chunks_stored_total").increment(1);
    counter!("chunkgrid_bytes_stored_total").increment(size);
}

pub fn record_chunk_served(size: u64) {
    counter!("chunkgrid_chunks_served_total").increment(1);
    counter!("chunkgrid_bytes_served_total").increment(size);
}

pub fn record_upload_committed(file_id: &str) {
    counter!("chunkgrid_uploads_total", "file_id" => file_id.to_string()).increment(1);
}

pub fn record_upload_failed(file_id: &str) {
    counter!("chunkgrid_uploads_failed_total", "file_id" => file_id.to_string()).increment(1);
}

pub fn record_download_completed(file_id: &str) {
    counter!("chunkgrid_downloads_total", "file_id" => file_id.to_string()).increment(1);
}

pub fn record_repair_started() {
    counter!("chunkgrid_repairs_started_total").increment(1);
}

pub fn record_repair_completed() {
    counter!("chunkgrid_repairs_completed_total").increment(1);
}

pub fn record_repair_failed() {
    counter!("chunkgrid_repairs_failed_total").increment(1);
}

pub fn record_node_failure(node_id: &str) {
    counter!("chunkgrid_node_failures_total", "node_id" => node_id.to_string()).increment(1);
}

pub fn record_under_replicated(count: usize) {
    gauge!("chunkgrid_under_replicated_chunks").set(count as f64);
}
