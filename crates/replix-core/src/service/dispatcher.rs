// Request dispatcher
// Sends one call per target node on a bounded worker pool and streams results into the cluster response

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::{
    metrics::{REPLICATION_NODE_FAILURES_TOTAL, REPLICATION_NODE_LATENCY_SECONDS},
    model::{Configuration, NodeIdentifier, NodeResponse},
};

use super::{
    node_client::{NodeClient, OutboundRequest},
    response::{AsyncClusterResponse, ClusterResponseSnapshot},
};

/// Notified once per replicated request after every node call has finished
pub trait RequestCompletionCallback: Send + Sync {
    fn after_request(&self, snapshot: &ClusterResponseSnapshot);
}

/// Configuration for the dispatcher
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Maximum number of node calls in flight at once
    pub worker_pool_size: usize,
    /// Timeout of a single node call
    pub node_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 20,
            node_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    /// Create a DispatcherConfig from application Configuration
    pub fn from_configuration(config: &Configuration) -> Self {
        Self {
            worker_pool_size: config.worker_pool_size(),
            node_timeout: Duration::from_millis(config.request_timeout_ms()),
        }
    }
}

/// Perform one node call, turning timeouts and transport errors into responses
pub async fn call_node(
    client: &dyn NodeClient,
    node_id: &NodeIdentifier,
    request: &OutboundRequest,
    timeout: Duration,
) -> NodeResponse {
    let started = Instant::now();
    let response = match tokio::time::timeout(timeout, client.send(node_id, request)).await {
        Ok(Ok(reply)) => NodeResponse::new(
            node_id.clone(),
            reply.status,
            reply.headers,
            reply.body,
            started.elapsed(),
        ),
        Ok(Err(e)) => {
            warn!(
                "{} {} to node {} failed (request {}): {}",
                request.method, request.uri, node_id, request.request_id, e
            );
            NodeResponse::unreachable(node_id.clone(), e.to_string(), started.elapsed())
        }
        Err(_) => {
            warn!(
                "{} {} to node {} timed out after {:?} (request {})",
                request.method, request.uri, node_id, timeout, request.request_id
            );
            NodeResponse::timeout(node_id.clone(), started.elapsed())
        }
    };

    histogram!(REPLICATION_NODE_LATENCY_SECONDS).record(response.latency.as_secs_f64());
    if !response.is_success() {
        counter!(REPLICATION_NODE_FAILURES_TOTAL, "status" => response.status.to_string())
            .increment(1);
    }

    response
}

/// Fans a request out to nodes concurrently
pub struct Dispatcher {
    client: Arc<dyn NodeClient>,
    permits: Arc<Semaphore>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn NodeClient>, config: DispatcherConfig) -> Self {
        Self {
            client,
            permits: Arc::new(Semaphore::new(config.worker_pool_size.max(1))),
            config,
        }
    }

    /// Start one task per node and return without waiting for any of them
    ///
    /// Each task merges its node's response as soon as it is available.
    pub fn dispatch(
        &self,
        response: Arc<AsyncClusterResponse>,
        request: Arc<OutboundRequest>,
        nodes: Vec<NodeIdentifier>,
        callback: Option<Arc<dyn RequestCompletionCallback>>,
    ) {
        debug!(
            "Dispatching {} {} to {} node(s) (request {})",
            request.method,
            request.uri,
            nodes.len(),
            request.request_id
        );

        let remaining = Arc::new(AtomicUsize::new(nodes.len()));

        for node_id in nodes {
            let client = self.client.clone();
            let permits = self.permits.clone();
            let node_timeout = self.config.node_timeout;
            let response = response.clone();
            let request = request.clone();
            let remaining = remaining.clone();
            let callback = callback.clone();

            tokio::spawn(async move {
                let node_response = match permits.acquire_owned().await {
                    Ok(permit) => {
                        let node_response =
                            call_node(client.as_ref(), &node_id, &request, node_timeout).await;
                        drop(permit);
                        node_response
                    }
                    Err(_) => NodeResponse::unreachable(
                        node_id.clone(),
                        "worker pool closed",
                        Duration::ZERO,
                    ),
                };

                response.merge(node_response);

                if remaining.fetch_sub(1, Ordering::AcqRel) == 1
                    && let Some(callback) = callback
                {
                    callback.after_request(&response.snapshot());
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use reqwest::Method;

    use super::*;
    use crate::{
        model::{NodeFailure, ReplicationRequest},
        service::{node_client::NodeReply, response::OverallStatus},
    };
    use replix_common::{ReplicationError, Result};

    fn node(id: &str) -> NodeIdentifier {
        NodeIdentifier::new(id, "127.0.0.1", 8080)
    }

    /// Answers per node: a status, a transport error, or a long sleep
    struct ScriptedClient {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedClient {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl NodeClient for ScriptedClient {
        async fn send(&self, node_id: &NodeIdentifier, _request: &OutboundRequest) -> Result<NodeReply> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match node_id.id.as_str() {
                "down" => Err(ReplicationError::NodeClient("connection refused".to_string())),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(NodeReply::new(200))
                }
                "conflict" => Ok(NodeReply::new(409).with_body("conflict")),
                _ => Ok(NodeReply::new(200).with_body("ok")),
            }
        }
    }

    struct RecordingCallback {
        snapshots: Mutex<Vec<ClusterResponseSnapshot>>,
    }

    impl RequestCompletionCallback for RecordingCallback {
        fn after_request(&self, snapshot: &ClusterResponseSnapshot) {
            self.snapshots.lock().unwrap().push(snapshot.clone());
        }
    }

    fn outbound() -> Arc<OutboundRequest> {
        let request = ReplicationRequest::new(Method::PUT, "/api/flow").unwrap();
        Arc::new(OutboundRequest::from_replication("req-1", &request))
    }

    fn cluster_response(nodes: &[NodeIdentifier], timeout: Duration) -> Arc<AsyncClusterResponse> {
        Arc::new(AsyncClusterResponse::new(
            "req-1",
            Method::PUT,
            "/api/flow",
            nodes.iter().cloned(),
            timeout,
        ))
    }

    #[tokio::test]
    async fn test_call_node_converts_failures() {
        let client = ScriptedClient::new();
        let request = outbound();

        let ok = call_node(&client, &node("n1"), &request, Duration::from_secs(1)).await;
        assert!(ok.is_success());
        assert_eq!(ok.body_text(), "ok");

        let down = call_node(&client, &node("down"), &request, Duration::from_secs(1)).await;
        assert_eq!(down.status, replix_common::NODE_UNREACHABLE_STATUS);
        assert!(matches!(down.failure, Some(NodeFailure::Transport(_))));

        let slow = call_node(&client, &node("slow"), &request, Duration::from_millis(50)).await;
        assert_eq!(slow.failure, Some(NodeFailure::Timeout));
    }

    #[tokio::test]
    async fn test_dispatch_merges_every_node() {
        let dispatcher = Dispatcher::new(Arc::new(ScriptedClient::new()), DispatcherConfig::default());
        let nodes = vec![node("n1"), node("conflict"), node("down")];
        let response = cluster_response(&nodes, Duration::from_secs(60));
        let callback = Arc::new(RecordingCallback {
            snapshots: Mutex::new(Vec::new()),
        });

        dispatcher.dispatch(response.clone(), outbound(), nodes, Some(callback.clone()));

        assert!(response.wait_for_completion(Duration::from_secs(5)).await);
        let snapshot = response.snapshot();
        assert_eq!(snapshot.responses.len(), 3);
        assert_eq!(
            snapshot.status,
            OverallStatus::Failure {
                node_id: node("conflict"),
                status: 409
            }
        );

        // The callback runs right after the last merge
        for _ in 0..50 {
            if !callback.snapshots.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snapshots = callback.snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].complete);
    }

    #[tokio::test]
    async fn test_dispatch_bounded_worker_pool() {
        let client = Arc::new(ScriptedClient::new());
        let dispatcher = Dispatcher::new(
            client.clone(),
            DispatcherConfig {
                worker_pool_size: 2,
                node_timeout: Duration::from_secs(5),
            },
        );
        let nodes: Vec<NodeIdentifier> = (0..8).map(|i| node(&format!("n{}", i))).collect();
        let response = cluster_response(&nodes, Duration::from_secs(60));

        dispatcher.dispatch(response.clone(), outbound(), nodes, None);

        assert!(response.wait_for_completion(Duration::from_secs(5)).await);
        assert!(response.snapshot().is_success());
        assert!(client.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_aggregate_timeout_records_missing_node() {
        let dispatcher = Dispatcher::new(
            Arc::new(ScriptedClient::new()),
            DispatcherConfig {
                worker_pool_size: 4,
                node_timeout: Duration::from_secs(30),
            },
        );
        let nodes = vec![node("n1"), node("slow")];
        let response = cluster_response(&nodes, Duration::from_millis(100));

        dispatcher.dispatch(response.clone(), outbound(), nodes, None);

        assert!(response.wait_for_completion(Duration::from_secs(5)).await);
        let snapshot = response.snapshot();
        assert!(snapshot.response(&node("n1")).unwrap().is_success());
        assert_eq!(
            snapshot.response(&node("slow")).unwrap().failure,
            Some(NodeFailure::Timeout)
        );
        assert!(snapshot.pending_nodes.is_empty());
    }
}
