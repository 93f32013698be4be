//! chunkgrid: a small distributed object-storage cluster.
//!
//! One coordinator tracks a dynamic population of storage nodes. Clients
//! upload files that are split into chunks, replicated across nodes, and
//! downloaded back with SHA-256 verification at every boundary. The cluster
//! detects node failures from heartbeat silence and automatically
//! re-replicates affected chunks back to their target count.
//!
//! ## Modules
//!
//! - **`store`**: per-node chunk storage and the bandwidth reservation
//!   ledger (utilisation is always the sum of live reservations).
//! - **`node`**: the storage node server — chunk put/get/delete over the
//!   wire, simulated transfer time, heartbeat emission.
//! - **`monitor`**: the coordinator's failure detector, a pure
//!   timestamp-driven HEALTHY/FAILED state machine plus its tick task.
//! - **`placement`**: replica target selection (diverse / least-loaded /
//!   random).
//! - **`index`**: the replica index mapping chunks to the nodes believed to
//!   hold them, in two always-consistent views.
//! - **`coordinator`**: registration, upload and download pipelines, the
//!   re-replication engine, and the coordinator RPC service.
//! - **`wire`**: the length-prefixed framed TCP protocol shared by all
//!   three processes.
//! - **`client`**: the thin client used by the `client` binary.
//! - **`integrity`**, **`config`**, **`metrics`**: checksums, tunables, and
//!   the metrics facade.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod index;
pub mod integrity;
pub mod metrics;
pub mod monitor;
pub mod node;
pub mod placement;
pub mod store;
pub mod wire;
