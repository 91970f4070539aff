// Core services for request replication

pub mod directory;
pub mod dispatcher;
pub mod node_client;
pub mod registry;
pub mod replicator;
pub mod response;
pub mod verification;

// Re-export commonly used types
pub use directory::{NodeDirectory, StaticNodeDirectory};
pub use dispatcher::{Dispatcher, DispatcherConfig, RequestCompletionCallback};
pub use node_client::{HttpNodeClient, HttpNodeClientConfig, NodeClient, NodeReply, OutboundRequest};
pub use registry::{ResponseRegistry, ResponseRegistryConfig};
pub use replicator::{ReplicationTarget, ReplicatorConfig, RequestReplicator};
pub use response::{AsyncClusterResponse, ClusterResponseSnapshot, OverallStatus};
pub use verification::VerificationController;
