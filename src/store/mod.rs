pub mod bandwidth;
pub mod chunk_store;
pub mod error;
pub mod types;

pub use bandwidth::{BandwidthAccountant, ReservationKey, TransferDirection};
pub use chunk_store::ChunkStore;
pub use error::{StoreError, StoreResult};
pub use types::ChunkKey;
