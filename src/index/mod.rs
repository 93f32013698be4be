pub mod replica_index;

pub use replica_index::{ReplicaIndex, UnderReplicated};
