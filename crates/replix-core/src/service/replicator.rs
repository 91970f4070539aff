// Request replicator
// Public entry point of the engine: resolves targets, verifies mutable requests,
// registers the cluster response and starts dispatch

use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use metrics::{counter, gauge};
use reqwest::Method;
use tracing::{debug, info, warn};

use replix_common::{ReplicationError, Result};

use crate::{
    metrics::{
        REPLICATION_OUTSTANDING_REQUESTS, REPLICATION_REJECTED_TOTAL, REPLICATION_REQUESTS_TOTAL,
    },
    model::{Configuration, NodeConnectionState, NodeIdentifier, ReplicationRequest, is_read_only_method},
};

use super::{
    directory::NodeDirectory,
    dispatcher::{Dispatcher, DispatcherConfig, RequestCompletionCallback},
    node_client::{NodeClient, OutboundRequest},
    registry::{ResponseRegistry, ResponseRegistryConfig},
    response::AsyncClusterResponse,
    verification::VerificationController,
};

/// Which nodes a request is replicated to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicationTarget {
    /// Every node the directory reports as connected
    AllConnected,
    /// An explicit subset of nodes
    Nodes(BTreeSet<NodeIdentifier>),
    /// The coordinator node, which fans the request out itself
    Coordinator(NodeIdentifier),
}

/// Configuration for the request replicator
#[derive(Clone, Debug)]
pub struct ReplicatorConfig {
    /// Aggregate timeout after which missing nodes are recorded as timed out
    pub response_timeout: Duration,
    /// Timeout of the whole verification round
    pub verification_timeout: Duration,
    pub dispatcher: DispatcherConfig,
    pub registry: ResponseRegistryConfig,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(60),
            verification_timeout: Duration::from_secs(10),
            dispatcher: DispatcherConfig::default(),
            registry: ResponseRegistryConfig::default(),
        }
    }
}

impl ReplicatorConfig {
    /// Create a ReplicatorConfig from application Configuration
    pub fn from_configuration(config: &Configuration) -> Self {
        Self {
            response_timeout: Duration::from_millis(config.response_timeout_ms()),
            verification_timeout: Duration::from_millis(config.verification_timeout_ms()),
            dispatcher: DispatcherConfig::from_configuration(config),
            registry: ResponseRegistryConfig::from_configuration(config),
        }
    }
}

/// Replicates requests to cluster nodes
///
/// `replicate` returns as soon as dispatch has started. Callers poll
/// `get_cluster_response` with the returned request identifier until the
/// response is complete; the first lookup that observes completion evicts it.
pub struct RequestReplicator {
    directory: Arc<dyn NodeDirectory>,
    dispatcher: Dispatcher,
    verifier: VerificationController,
    registry: Arc<ResponseRegistry>,
    config: ReplicatorConfig,
    callback: Option<Arc<dyn RequestCompletionCallback>>,
    sweeper_started: AtomicBool,
    stopped: AtomicBool,
}

impl RequestReplicator {
    pub fn new(
        directory: Arc<dyn NodeDirectory>,
        client: Arc<dyn NodeClient>,
        config: ReplicatorConfig,
    ) -> Self {
        let verifier = VerificationController::new(
            directory.clone(),
            client.clone(),
            config.verification_timeout,
        );

        Self {
            directory,
            dispatcher: Dispatcher::new(client, config.dispatcher.clone()),
            verifier,
            registry: Arc::new(ResponseRegistry::new(config.registry.clone())),
            config,
            callback: None,
            sweeper_started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Set the callback invoked once per request after every node call finished
    pub fn with_completion_callback(mut self, callback: Arc<dyn RequestCompletionCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Replicate a request to a set of nodes
    pub async fn replicate(
        &self,
        target: ReplicationTarget,
        request: ReplicationRequest,
    ) -> Result<Arc<AsyncClusterResponse>> {
        match self.try_replicate(&target, &request).await {
            Ok(response) => {
                counter!(REPLICATION_REQUESTS_TOTAL, "method" => request.method().to_string())
                    .increment(1);
                Ok(response)
            }
            Err(e) => {
                counter!(REPLICATION_REJECTED_TOTAL, "method" => request.method().to_string())
                    .increment(1);
                warn!(
                    "Rejected replication of {} {}: {}",
                    request.method(),
                    request.uri(),
                    e
                );
                Err(e)
            }
        }
    }

    async fn try_replicate(
        &self,
        target: &ReplicationTarget,
        request: &ReplicationRequest,
    ) -> Result<Arc<AsyncClusterResponse>> {
        if self.is_stopped() {
            return Err(ReplicationError::ServiceStopped);
        }
        self.ensure_sweeper();

        let nodes = self.resolve_targets(target, request)?;
        let request_id = uuid::Uuid::new_v4().to_string();
        let outbound = match target {
            // The coordinator only fans out requests that are not marked as replicated
            ReplicationTarget::Coordinator(_) => OutboundRequest::from_replication(
                &request_id,
                &request.clone().indicate_replicated(false),
            ),
            _ => OutboundRequest::from_replication(&request_id, request),
        };

        let verify = request.is_mutable()
            && request.is_perform_verification()
            && !matches!(target, ReplicationTarget::Coordinator(_));
        if verify {
            self.verifier.verify(&outbound, &nodes).await?;
        }

        if self.is_stopped() {
            return Err(ReplicationError::ServiceStopped);
        }

        let response = Arc::new(AsyncClusterResponse::new(
            request_id.as_str(),
            request.method().clone(),
            request.uri(),
            nodes.iter().cloned(),
            self.config.response_timeout,
        ));
        self.registry.register(response.clone())?;
        gauge!(REPLICATION_OUTSTANDING_REQUESTS).set(self.registry.len() as f64);

        info!(
            "Replicating {} {} to {} node(s) (request {})",
            request.method(),
            request.uri(),
            nodes.len(),
            request_id
        );
        self.dispatcher.dispatch(
            response.clone(),
            Arc::new(outbound),
            nodes,
            self.callback.clone(),
        );

        Ok(response)
    }

    /// Work out the target nodes and enforce the per-target rules
    fn resolve_targets(
        &self,
        target: &ReplicationTarget,
        request: &ReplicationRequest,
    ) -> Result<Vec<NodeIdentifier>> {
        match target {
            ReplicationTarget::AllConnected => {
                if request.is_mutable() {
                    self.ensure_cluster_ready(request.is_perform_verification())?;
                }
                let nodes = self.directory.connected_nodes();
                if nodes.is_empty() {
                    return Err(ReplicationError::InvalidTarget(
                        "no connected nodes in the cluster".to_string(),
                    ));
                }
                Ok(nodes)
            }
            ReplicationTarget::Nodes(nodes) => {
                if nodes.is_empty() {
                    return Err(ReplicationError::InvalidTarget(
                        "the set of target nodes is empty".to_string(),
                    ));
                }
                if is_read_only_method(request.method()) || *request.method() == Method::DELETE {
                    return Err(ReplicationError::IllegalArgument(format!(
                        "{} requests cannot be replicated to an explicit set of nodes",
                        request.method()
                    )));
                }
                Ok(nodes.iter().cloned().collect())
            }
            ReplicationTarget::Coordinator(node) => Ok(vec![node.clone()]),
        }
    }

    /// Mutable requests to the whole cluster need every known node connected
    fn ensure_cluster_ready(&self, check_connecting: bool) -> Result<()> {
        let nodes = self.directory.nodes();

        if check_connecting
            && let Some((node, _)) = nodes
                .iter()
                .find(|(_, state)| *state == NodeConnectionState::Connecting)
        {
            return Err(ReplicationError::ConnectingNodeMutableRequest(
                node.to_string(),
            ));
        }

        if let Some((node, _)) = nodes.iter().find(|(_, state)| {
            matches!(
                state,
                NodeConnectionState::Disconnected | NodeConnectionState::Disconnecting
            )
        }) {
            return Err(ReplicationError::DisconnectedNodeMutableRequest(
                node.to_string(),
            ));
        }

        Ok(())
    }

    /// Replicate a request to every connected node
    pub async fn replicate_all(&self, request: ReplicationRequest) -> Result<Arc<AsyncClusterResponse>> {
        self.replicate(ReplicationTarget::AllConnected, request).await
    }

    /// Replicate a request to an explicit set of nodes
    pub async fn replicate_to_nodes(
        &self,
        nodes: impl IntoIterator<Item = NodeIdentifier>,
        request: ReplicationRequest,
    ) -> Result<Arc<AsyncClusterResponse>> {
        self.replicate(ReplicationTarget::Nodes(nodes.into_iter().collect()), request)
            .await
    }

    /// Hand a request to the coordinator node, which replicates it to the cluster
    ///
    /// The forwarded request never carries the replicated marker.
    pub async fn forward_to_coordinator(
        &self,
        coordinator: NodeIdentifier,
        request: ReplicationRequest,
    ) -> Result<Arc<AsyncClusterResponse>> {
        self.replicate(ReplicationTarget::Coordinator(coordinator), request)
            .await
    }

    /// Look up a cluster response without waiting
    ///
    /// Returns `None` for unknown identifiers and for responses whose
    /// completion was already observed by an earlier call.
    pub fn get_cluster_response(&self, request_id: &str) -> Option<Arc<AsyncClusterResponse>> {
        let response = self.registry.get(request_id);
        gauge!(REPLICATION_OUTSTANDING_REQUESTS).set(self.registry.len() as f64);
        response
    }

    /// Number of responses currently held by the registry
    pub fn outstanding_requests(&self) -> usize {
        self.registry.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop accepting requests and tear down the registry
    ///
    /// Node calls already dispatched run to completion.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            debug!("Request replicator already stopped");
            return;
        }
        self.registry.stop();
        gauge!(REPLICATION_OUTSTANDING_REQUESTS).set(0.0);
        info!("Request replicator stopped");
    }

    fn ensure_sweeper(&self) {
        if !self.sweeper_started.swap(true, Ordering::AcqRel) {
            self.registry.start_sweeper();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::service::{directory::StaticNodeDirectory, node_client::NodeReply};
    use replix_common::NODE_CONTINUE_STATUS;

    fn node(id: &str) -> NodeIdentifier {
        NodeIdentifier::new(id, "127.0.0.1", 8080)
    }

    #[derive(Default)]
    struct CountingClient {
        calls: Mutex<Vec<NodeIdentifier>>,
        markers: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl NodeClient for CountingClient {
        async fn send(&self, node_id: &NodeIdentifier, request: &OutboundRequest) -> Result<NodeReply> {
            self.calls.lock().unwrap().push(node_id.clone());
            self.markers.lock().unwrap().push(
                request
                    .header(replix_common::REPLICATION_INDICATOR_HEADER)
                    .map(str::to_string),
            );
            if request.header(replix_common::VALIDATION_EXPECTS_HEADER).is_some() {
                return Ok(NodeReply::new(NODE_CONTINUE_STATUS));
            }
            Ok(NodeReply::new(200))
        }
    }

    fn replicator(directory: StaticNodeDirectory) -> (RequestReplicator, Arc<CountingClient>) {
        let client = Arc::new(CountingClient::default());
        let replicator =
            RequestReplicator::new(Arc::new(directory), client.clone(), ReplicatorConfig::default());
        (replicator, client)
    }

    #[test]
    fn test_config_from_configuration() {
        let config = config::Config::builder()
            .set_override("replix.replication.response-timeout", 1500)
            .unwrap()
            .set_override("replix.replication.worker-pool-size", 4)
            .unwrap()
            .build()
            .unwrap();
        let config = ReplicatorConfig::from_configuration(&Configuration::from_config(config));

        assert_eq!(config.response_timeout, Duration::from_millis(1500));
        assert_eq!(config.dispatcher.worker_pool_size, 4);
        assert_eq!(config.verification_timeout, Duration::from_secs(10));
        assert_eq!(config.registry.max_outstanding, 100);
    }

    #[tokio::test]
    async fn test_all_connected_without_nodes() {
        let (replicator, _) = replicator(StaticNodeDirectory::new());
        let result = replicator
            .replicate_all(ReplicationRequest::new(Method::GET, "/api/flow").unwrap())
            .await;
        assert!(matches!(result, Err(ReplicationError::InvalidTarget(_))));
    }

    #[tokio::test]
    async fn test_all_connected_mutable_with_disconnected_node() {
        let directory = StaticNodeDirectory::connected([node("n1")]);
        directory.add_node(node("n2"), NodeConnectionState::Disconnected);
        let (replicator, client) = replicator(directory);

        let result = replicator
            .replicate_all(ReplicationRequest::new(Method::PUT, "/api/flow").unwrap())
            .await;
        assert!(matches!(
            result,
            Err(ReplicationError::DisconnectedNodeMutableRequest(_))
        ));
        assert!(client.calls.lock().unwrap().is_empty());

        // Read-only requests still reach the connected part of the cluster
        let response = replicator
            .replicate_all(ReplicationRequest::new(Method::GET, "/api/flow").unwrap())
            .await
            .unwrap();
        assert_eq!(response.expected_nodes().len(), 1);
    }

    #[tokio::test]
    async fn test_all_connected_mutable_with_connecting_node() {
        let directory = StaticNodeDirectory::connected([node("n1")]);
        directory.add_node(node("n2"), NodeConnectionState::Connecting);
        let (replicator, client) = replicator(directory);

        let result = replicator
            .replicate_all(ReplicationRequest::new(Method::POST, "/api/processors").unwrap())
            .await;
        assert!(matches!(
            result,
            Err(ReplicationError::ConnectingNodeMutableRequest(_))
        ));
        assert!(client.calls.lock().unwrap().is_empty());
        assert_eq!(replicator.outstanding_requests(), 0);
    }

    #[tokio::test]
    async fn test_forward_to_coordinator_skips_verification() {
        let (replicator, client) = replicator(StaticNodeDirectory::new());
        let coordinator = node("coordinator");

        let response = replicator
            .forward_to_coordinator(
                coordinator.clone(),
                ReplicationRequest::new(Method::DELETE, "/api/processors/p1").unwrap(),
            )
            .await
            .unwrap();

        assert!(response.wait_for_completion(Duration::from_secs(5)).await);
        assert_eq!(*client.calls.lock().unwrap(), vec![coordinator]);
    }

    #[tokio::test]
    async fn test_forward_to_coordinator_drops_replicated_marker() {
        let (replicator, client) = replicator(StaticNodeDirectory::connected([node("n1")]));

        let request = ReplicationRequest::new(Method::PUT, "/api/flow").unwrap();
        assert!(request.is_indicate_replicated());
        let response = replicator
            .forward_to_coordinator(node("coordinator"), request)
            .await
            .unwrap();
        assert!(response.wait_for_completion(Duration::from_secs(5)).await);
        assert_eq!(*client.markers.lock().unwrap(), vec![None]);

        // Fan-out keeps the marker
        let response = replicator
            .replicate_all(ReplicationRequest::new(Method::GET, "/api/flow").unwrap())
            .await
            .unwrap();
        assert!(response.wait_for_completion(Duration::from_secs(5)).await);
        assert_eq!(
            client.markers.lock().unwrap().last().cloned().flatten().as_deref(),
            Some("true")
        );
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (replicator, _) = replicator(StaticNodeDirectory::connected([node("n1")]));
        replicator.shutdown();
        replicator.shutdown();
        assert!(replicator.is_stopped());

        let result = replicator
            .replicate_all(ReplicationRequest::new(Method::GET, "/api/flow").unwrap())
            .await;
        assert_eq!(result.unwrap_err(), ReplicationError::ServiceStopped);
    }
}
