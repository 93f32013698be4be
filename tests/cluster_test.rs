//! End-to-end tests against an in-process cluster: a real coordinator and
//! real storage nodes on ephemeral ports, with all timeouts dialled down.

use chunkgrid::client::ClusterClient;
use chunkgrid::config::ClusterConfig;
use chunkgrid::coordinator::CoordinatorService;
use chunkgrid::node::{NodeConfig, StorageNode};
use chunkgrid::store::ChunkKey;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct TestNode {
    node: Arc<StorageNode>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct TestCluster {
    service: Arc<CoordinatorService>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    nodes: Vec<TestNode>,
}

/// Production defaults compressed to test time scales.
fn test_config() -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.chunking.small_chunk_size = 16 * 1024;
    config.monitor.heartbeat_interval = Duration::from_millis(150);
    config.monitor.tick_interval = Duration::from_millis(50);
    config.monitor.failure_timeout = Duration::from_millis(600);
    config.monitor.gc_grace = Duration::from_millis(400);
    config.network.rpc_timeout = Duration::from_secs(5);
    config.network.retry_delay = Duration::from_millis(20);
    config.network.base_latency = Duration::from_millis(0);
    config.repair.sweep_interval = Duration::from_millis(400);
    config.repair.backoff_base = Duration::from_millis(100);
    config.repair.backoff_cap = Duration::from_secs(2);
    config
}

async fn start_cluster(config: ClusterConfig, node_capacities: &[u64]) -> TestCluster {
    let service = CoordinatorService::bind(config, "127.0.0.1", 0)
        .await
        .expect("coordinator failed to bind");

    let (shutdown, shutdown_rx) = watch::channel(false);
    let runner = service.clone();
    let task = tokio::spawn(async move {
        runner.run(shutdown_rx).await.expect("coordinator crashed");
    });

    let mut cluster = TestCluster {
        service,
        shutdown,
        task,
        nodes: Vec::new(),
    };
    for (i, capacity) in node_capacities.iter().enumerate() {
        cluster.add_node(&format!("node-{i}"), *capacity).await;
    }
    cluster
}

impl TestCluster {
    async fn add_node(&mut self, node_id: &str, capacity: u64) {
        let config = NodeConfig::builder(node_id, self.service.local_addr())
            .capacity_bytes(capacity)
            .bandwidth_bps(1_000_000_000)
            .heartbeat_interval(Duration::from_millis(150))
            .base_latency(Duration::from_millis(0))
            .verify_on_read(false)
            .build();

        let node = StorageNode::bind(config).await.expect("node failed to bind");
        node.register().await.expect("node failed to register");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let runner = node.clone();
        let task = tokio::spawn(async move {
            runner.run(shutdown_rx).await.expect("node crashed");
        });

        self.nodes.push(TestNode {
            node,
            shutdown,
            task,
        });
    }

    fn client(&self) -> ClusterClient {
        ClusterClient::new(self.service.local_addr())
    }

    /// Simulate a crash: tear the node's tasks down without the graceful
    /// deregistration path. Aborting the run task first guarantees the
    /// goodbye never goes out; the shutdown flag then stops the heartbeat
    /// emitter, which runs as its own task.
    fn kill_node(&mut self, index: usize) {
        self.nodes[index].task.abort();
        let _ = self.nodes[index].shutdown.send(true);
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for test_node in &self.nodes {
            let _ = test_node.shutdown.send(true);
        }
        self.task.abort();
        for test_node in self.nodes {
            test_node.task.abort();
        }
    }
}

/// Poll `check` until it holds or `limit` passes.
async fn eventually<F: Fn() -> bool>(limit: Duration, what: &str, check: F) {
    let start = Instant::now();
    while start.elapsed() < limit {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition never held within {limit:?}: {what}");
}

fn patterned_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_download_round_trip() {
    let cluster = start_cluster(test_config(), &[100 << 20, 150 << 20, 200 << 20]).await;
    let client = cluster.client();

    // 80 KiB over 16 KiB chunks: five chunks, three replicas each
    let data = patterned_data(80 * 1024);
    let file_id = client.upload("test.bin", &data, 3).await.unwrap();

    let downloaded = client.download(&file_id).await.unwrap();
    assert_eq!(downloaded, data);

    let index = cluster.service.replica_index();
    for chunk_index in 0..5 {
        let key = ChunkKey::new(file_id.clone(), chunk_index);
        assert_eq!(
            index.locations(&key).len(),
            3,
            "chunk {chunk_index} should be on every node"
        );
    }

    // every node holds one full copy
    for test_node in &cluster.nodes {
        assert_eq!(test_node.node.chunk_store().chunk_count(), 5);
        assert_eq!(test_node.node.chunk_store().used_bytes(), 80 * 1024);
        assert_eq!(test_node.node.bandwidth().utilisation(), 0.0);
    }

    let status = client.status().await.unwrap();
    assert_eq!(status.total_nodes, 3);
    assert_eq!(status.healthy_nodes, 3);
    assert_eq!(status.file_count, 1);
    assert_eq!(status.under_replicated_count, 0);

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_byte_file_survives_round_trip() {
    let cluster = start_cluster(test_config(), &[100 << 20, 150 << 20, 200 << 20]).await;
    let client = cluster.client();

    let data = vec![0x41u8; 40 * 1024];
    let file_id = client.upload("a.bin", &data, 3).await.unwrap();
    assert_eq!(client.download(&file_id).await.unwrap(), data);

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn node_failure_triggers_rereplication() {
    let mut cluster = start_cluster(test_config(), &[100 << 20, 150 << 20, 200 << 20]).await;
    let client = cluster.client();

    let data = patterned_data(80 * 1024);
    let file_id = client.upload("resilient.bin", &data, 3).await.unwrap();

    cluster.kill_node(1);
    let dead_id = cluster.nodes[1].node.node_id().to_string();

    // the monitor declares the node FAILED and its replicas leave the index
    let index = cluster.service.replica_index().clone();
    let dead = dead_id.clone();
    eventually(Duration::from_secs(5), "dead node leaves replica sets", move || {
        index.chunks_on(&dead).is_empty()
    })
    .await;

    let status = client.status().await.unwrap();
    assert_eq!(status.healthy_nodes, 2);
    assert_eq!(status.under_replicated_count, 5);

    // a fresh node restores the target factor
    cluster.add_node("node-3", 100 << 20).await;

    let index = cluster.service.replica_index().clone();
    let file = file_id.clone();
    eventually(Duration::from_secs(10), "replication factor restored", move || {
        (0..5).all(|i| index.locations(&ChunkKey::new(file.clone(), i)).len() == 3)
    })
    .await;

    let status = client.status().await.unwrap();
    assert_eq!(status.under_replicated_count, 0);

    // the cluster still serves the file, byte for byte
    assert_eq!(client.download(&file_id).await.unwrap(), data);

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupt_replica_is_detected_and_restored() {
    let cluster = start_cluster(test_config(), &[100 << 20, 150 << 20, 200 << 20]).await;
    let client = cluster.client();

    let data = patterned_data(20 * 1024);
    let file_id = client.upload("fragile.bin", &data, 2).await.unwrap();

    // flip a bit in whichever replica chunk 0 landed on first
    let key = ChunkKey::new(file_id.clone(), 0);
    let holders = cluster.service.replica_index().locations(&key);
    let corrupted_node = cluster
        .nodes
        .iter()
        .find(|n| holders.contains(n.node.node_id()))
        .expect("some node holds chunk 0");
    assert!(corrupted_node.node.chunk_store().corrupt_stored_bytes(&key));

    // the download still round-trips by falling back to the good replica
    assert_eq!(client.download(&file_id).await.unwrap(), data);

    // the suspect is evicted and replaced: eventually two replicas exist and
    // every one of them hashes to the manifest checksum
    let index = cluster.service.replica_index().clone();
    let stores: Vec<(String, Arc<StorageNode>)> = cluster
        .nodes
        .iter()
        .map(|n| (n.node.node_id().to_string(), n.node.clone()))
        .collect();
    let key_again = key.clone();
    let expected_chunk =
        chunkgrid::integrity::IntegrityVerifier::calculate_checksum(&data[..16 * 1024]);
    eventually(
        Duration::from_secs(10),
        "corrupt replica evicted and replaced",
        move || {
            let locations = index.locations(&key_again);
            locations.len() == 2
                && locations.iter().all(|holder| {
                    stores.iter().any(|(id, node)| {
                        id == holder
                            && node
                                .chunk_store()
                                .get(&key_again)
                                .is_ok_and(|bytes| {
                                    chunkgrid::integrity::IntegrityVerifier::calculate_checksum(
                                        &bytes,
                                    ) == expected_chunk
                                })
                    })
                })
        },
    )
    .await;

    // and the file still reads back intact
    assert_eq!(client.download(&file_id).await.unwrap(), data);

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn capacity_exhaustion_rejects_upload_cleanly() {
    // three tiny nodes: 5 MiB at r=3 cannot fit in 1 MiB per node
    let cluster = start_cluster(test_config(), &[1 << 20, 1 << 20, 1 << 20]).await;
    let client = cluster.client();

    let data = patterned_data(5 * 1024 * 1024);
    let result = client.upload("too-big.bin", &data, 3).await;
    assert!(result.is_err(), "upload should fail for lack of capacity");

    // nothing may survive the abort
    for test_node in &cluster.nodes {
        let node = test_node.node.clone();
        eventually(Duration::from_secs(5), "partial chunks collected", move || {
            node.chunk_store().chunk_count() == 0
        })
        .await;
    }
    assert_eq!(cluster.service.replica_index().chunk_count(), 0);

    let status = client.status().await.unwrap();
    assert_eq!(status.file_count, 0);

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn validation_errors_rejected_at_the_boundary() {
    let cluster = start_cluster(test_config(), &[100 << 20]).await;
    let client = cluster.client();

    // zero replication factor
    let result = client.upload("bad.bin", b"data", 0).await;
    assert!(result.is_err());

    // replication beyond the configured maximum
    let result = client.upload("bad.bin", b"data", 99).await;
    assert!(result.is_err());

    // download of a well-formed but unknown id
    let result = client.download("0123456789abcdef0123456789abcdef").await;
    assert!(result.is_err());

    // download of a malformed id
    let result = client.download("not-a-file-id").await;
    assert!(result.is_err());

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_chunks_are_garbage_collected_after_restart() {
    let mut config = test_config();
    config.monitor.gc_grace = Duration::from_millis(400);
    let mut cluster = start_cluster(config, &[100 << 20, 150 << 20, 200 << 20, 100 << 20]).await;
    let client = cluster.client();

    let data = patterned_data(80 * 1024);
    let file_id = client.upload("sticky.bin", &data, 2).await.unwrap();

    // remember which chunks node held, then crash it
    let victim_index = {
        let index = cluster.service.replica_index();
        cluster
            .nodes
            .iter()
            .position(|n| !index.chunks_on(n.node.node_id()).is_empty())
            .expect("someone holds chunks")
    };
    let victim_id = cluster.nodes[victim_index].node.node_id().to_string();
    let victim_chunks = cluster
        .service
        .replica_index()
        .chunks_on(&victim_id);
    let victim_bytes: Vec<(ChunkKey, bytes::Bytes)> = victim_chunks
        .iter()
        .map(|key| {
            let bytes = cluster.nodes[victim_index]
                .node
                .chunk_store()
                .get(key)
                .unwrap();
            (key.clone(), bytes)
        })
        .collect();
    cluster.kill_node(victim_index);

    // wait for failure detection and full repair
    let index = cluster.service.replica_index().clone();
    let file = file_id.clone();
    eventually(Duration::from_secs(10), "repair restores factor", move || {
        (0..5).all(|i| index.locations(&ChunkKey::new(file.clone(), i)).len() == 2)
    })
    .await;

    // "restart" the node: same id, fresh process, still holding its old chunks
    cluster.add_node(&victim_id, 100 << 20).await;
    let restarted = cluster.nodes.last().unwrap();
    for (key, bytes) in &victim_bytes {
        let checksum = chunkgrid::integrity::IntegrityVerifier::calculate_checksum(bytes);
        restarted
            .node
            .chunk_store()
            .put(key.clone(), bytes.clone(), &checksum)
            .unwrap();
    }

    // its heartbeats report the stale copies; the grace period expires and
    // they are deleted from the node without touching the live replicas
    let restarted_node = restarted.node.clone();
    eventually(Duration::from_secs(10), "stale chunks collected", move || {
        restarted_node.chunk_store().chunk_count() == 0
    })
    .await;

    let index = cluster.service.replica_index();
    for i in 0..5 {
        assert_eq!(index.locations(&ChunkKey::new(file_id.clone(), i)).len(), 2);
    }
    assert_eq!(client.download(&file_id).await.unwrap(), data);

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_deregistration_is_not_a_failure() {
    let cluster = start_cluster(test_config(), &[100 << 20, 150 << 20, 200 << 20, 100 << 20]).await;
    let client = cluster.client();

    let data = patterned_data(40 * 1024);
    let file_id = client.upload("drain.bin", &data, 2).await.unwrap();

    // politely shut one holder down; it deregisters on the way out
    let victim_index = {
        let index = cluster.service.replica_index();
        cluster
            .nodes
            .iter()
            .position(|n| !index.chunks_on(n.node.node_id()).is_empty())
            .expect("someone holds chunks")
    };
    let _ = cluster.nodes[victim_index].shutdown.send(true);

    // its replicas leave the index promptly (no failure-timeout wait) and the
    // repair engine restores the count on surviving nodes
    let index = cluster.service.replica_index().clone();
    let file = file_id.clone();
    eventually(Duration::from_secs(10), "count restored after drain", move || {
        (0..3).all(|i| index.locations(&ChunkKey::new(file.clone(), i)).len() == 2)
    })
    .await;

    assert_eq!(client.download(&file_id).await.unwrap(), data);
    cluster.stop().await;
}
