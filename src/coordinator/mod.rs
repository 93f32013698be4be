pub mod download;
pub mod error;
pub mod registry;
pub mod repair;
pub mod rpc;
pub mod service;
pub mod types;
pub mod upload;

pub use download::DownloadManager;
pub use error::{CoordinatorError, CoordinatorResult};
pub use registry::{NodeRegistry, RegistrationOutcome};
pub use repair::{RepairEngine, RepairSignal};
pub use rpc::NodeRpc;
pub use service::CoordinatorService;
pub use types::{FileManifest, NodeDescriptor, NodeLifecycle};
pub use upload::UploadManager;
