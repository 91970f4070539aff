// Verification controller
// Checks connectivity and asks every target node to accept a mutable request before it is replicated

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use futures::{StreamExt, stream::FuturesUnordered};
use metrics::counter;
use tracing::{debug, warn};

use replix_common::{NODE_CONTINUE_STATUS, ReplicationError, Result};

use crate::{
    metrics::REPLICATION_VERIFICATIONS_TOTAL,
    model::{NodeConnectionState, NodeIdentifier},
};

use super::{
    directory::NodeDirectory,
    dispatcher::call_node,
    node_client::{NodeClient, OutboundRequest},
    response::instant_after,
};

/// Runs the verification phase of mutable requests
pub struct VerificationController {
    directory: Arc<dyn NodeDirectory>,
    client: Arc<dyn NodeClient>,
    timeout: Duration,
}

impl VerificationController {
    pub fn new(
        directory: Arc<dyn NodeDirectory>,
        client: Arc<dyn NodeClient>,
        timeout: Duration,
    ) -> Self {
        Self {
            directory,
            client,
            timeout,
        }
    }

    /// Fail if any node is not connected
    ///
    /// A connecting node takes precedence over a disconnected one so callers
    /// can tell "retry shortly" apart from "cluster degraded".
    pub fn check_connectivity<'a>(
        &self,
        nodes: impl IntoIterator<Item = &'a NodeIdentifier>,
    ) -> Result<()> {
        let mut disconnected: Option<&NodeIdentifier> = None;

        for node_id in nodes {
            match self.directory.connection_state(node_id) {
                Some(NodeConnectionState::Connected) => {}
                Some(NodeConnectionState::Connecting) => {
                    return Err(ReplicationError::ConnectingNodeMutableRequest(
                        node_id.to_string(),
                    ));
                }
                _ => {
                    disconnected.get_or_insert(node_id);
                }
            }
        }

        match disconnected {
            Some(node_id) => Err(ReplicationError::DisconnectedNodeMutableRequest(
                node_id.to_string(),
            )),
            None => Ok(()),
        }
    }

    /// Check connectivity, then ask every node whether it can perform the request
    ///
    /// Every node must answer with the continue status within the
    /// verification timeout; otherwise the request must not be replicated.
    pub async fn verify(&self, request: &OutboundRequest, nodes: &[NodeIdentifier]) -> Result<()> {
        self.check_connectivity(nodes)?;

        counter!(REPLICATION_VERIFICATIONS_TOTAL).increment(1);
        debug!(
            "Verifying {} {} with {} node(s) (request {})",
            request.method,
            request.uri,
            nodes.len(),
            request.request_id
        );

        let check = request.verification_probe();
        let deadline = instant_after(self.timeout);
        let mut pending: BTreeSet<&NodeIdentifier> = nodes.iter().collect();

        let mut checks: FuturesUnordered<_> = nodes
            .iter()
            .map(|node_id| {
                let check = &check;
                async move {
                    (
                        node_id,
                        call_node(self.client.as_ref(), node_id, check, self.timeout).await,
                    )
                }
            })
            .collect();

        loop {
            let next = match tokio::time::timeout_at(deadline, checks.next()).await {
                Ok(next) => next,
                Err(_) => {
                    let node = pending
                        .first()
                        .map(|n| n.to_string())
                        .unwrap_or_default();
                    warn!(
                        "Verification of request {} timed out after {:?}",
                        request.request_id, self.timeout
                    );
                    return Err(ReplicationError::VerificationFailed {
                        node,
                        reason: format!("no answer within {:?}", self.timeout),
                    });
                }
            };

            let Some((node_id, response)) = next else {
                break;
            };
            pending.remove(node_id);

            let reason = match &response.failure {
                Some(failure) => Some(failure.to_string()),
                None if response.status != NODE_CONTINUE_STATUS => Some(format!(
                    "answered {} instead of {}: {}",
                    response.status,
                    NODE_CONTINUE_STATUS,
                    response.body_text()
                )),
                None => None,
            };

            if let Some(reason) = reason {
                warn!(
                    "Node {} rejected request {}: {}",
                    node_id, request.request_id, reason
                );
                return Err(ReplicationError::VerificationFailed {
                    node: node_id.to_string(),
                    reason,
                });
            }
        }

        debug!("All nodes accepted request {}", request.request_id);
        Ok(())
    }
}
