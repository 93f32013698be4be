use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlacementError {
    /// Fewer qualifying nodes than requested. Carries what was available so
    /// the caller can decide whether to accept degraded replication.
    #[error("needed {wanted} placement targets, only {} qualify", available.len())]
    InsufficientCandidates {
        available: Vec<String>,
        wanted: usize,
    },
}

pub type PlacementResult<T> = Result<T, PlacementError>;
