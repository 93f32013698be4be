pub mod client;
pub mod error;

pub use client::ClusterClient;
pub use error::{ClientError, ClientResult};
