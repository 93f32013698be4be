use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("wire error: {0}")]
    Wire(#[from] crate::wire::WireError),

    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("integrity error: {0}")]
    Integrity(#[from] crate::integrity::IntegrityError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registration rejected by coordinator: {0}")]
    RegistrationRejected(String),
}

pub type NodeResult<T> = Result<T, NodeError>;
