//! Asynchronous cluster response
//!
//! An `AsyncClusterResponse` accumulates the per-node outcomes of one
//! replicated request. Dispatcher workers merge into it concurrently while
//! callers read snapshots. Completion is reached when every expected node has
//! reported or when the aggregate timeout elapses, at which point missing nodes
//! are recorded as timeouts and the response set freezes.

use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use parking_lot::Mutex;
use reqwest::Method;
use serde::Serialize;
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, warn};

use crate::model::{NodeIdentifier, NodeResponse};

/// Merged outcome of a cluster response
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum OverallStatus {
    /// Not every node has reported yet
    Pending,
    /// Every node reported a 2xx status
    #[serde(rename_all = "camelCase")]
    Success { status: u16 },
    /// First non-success node in identifier order
    #[serde(rename_all = "camelCase")]
    Failure { node_id: NodeIdentifier, status: u16 },
}

/// Immutable view of a cluster response at one point in time
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResponseSnapshot {
    pub request_id: String,
    pub method: String,
    pub uri: String,
    pub complete: bool,
    pub status: OverallStatus,
    /// Known node responses ordered by node identifier
    pub responses: Vec<NodeResponse>,
    /// Nodes that have not reported yet
    pub pending_nodes: Vec<NodeIdentifier>,
}

impl ClusterResponseSnapshot {
    pub fn is_success(&self) -> bool {
        matches!(self.status, OverallStatus::Success { .. })
    }

    pub fn response(&self, node_id: &NodeIdentifier) -> Option<&NodeResponse> {
        self.responses.iter().find(|r| &r.node_id == node_id)
    }

    /// Responses that did not succeed, in node identifier order
    pub fn failed_responses(&self) -> impl Iterator<Item = &NodeResponse> {
        self.responses.iter().filter(|r| !r.is_success())
    }
}

/// `now + timeout`, saturating far in the future instead of overflowing
pub(crate) fn instant_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86400 * 365))
}

#[derive(Debug, Default)]
struct ResponseState {
    responses: HashMap<NodeIdentifier, NodeResponse>,
    completed_at: Option<Instant>,
}

/// Thread-safe accumulator for the node responses of one replicated request
#[derive(Debug)]
pub struct AsyncClusterResponse {
    request_id: String,
    method: Method,
    uri: String,
    expected_nodes: BTreeSet<NodeIdentifier>,
    created_at: i64,
    deadline: Instant,
    timeout: Duration,
    state: Mutex<ResponseState>,
    completion: Notify,
}

impl AsyncClusterResponse {
    pub fn new(
        request_id: impl Into<String>,
        method: Method,
        uri: impl Into<String>,
        expected_nodes: impl IntoIterator<Item = NodeIdentifier>,
        timeout: Duration,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            method,
            uri: uri.into(),
            expected_nodes: expected_nodes.into_iter().collect(),
            created_at: chrono::Utc::now().timestamp_millis(),
            deadline: instant_after(timeout),
            timeout,
            state: Mutex::new(ResponseState::default()),
            completion: Notify::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn expected_nodes(&self) -> &BTreeSet<NodeIdentifier> {
        &self.expected_nodes
    }

    /// Creation time in milliseconds since the UNIX epoch
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Record a node's response
    ///
    /// Returns false without touching the response set if the response is
    /// already complete or the node was not targeted.
    pub fn merge(&self, response: NodeResponse) -> bool {
        let mut state = self.state.lock();

        if self.check_completion(&mut state) {
            warn!(
                "Ignoring response from {} for request {}: response already complete",
                response.node_id, self.request_id
            );
            return false;
        }

        if !self.expected_nodes.contains(&response.node_id) {
            warn!(
                "Ignoring response from {} for request {}: node was not targeted",
                response.node_id, self.request_id
            );
            return false;
        }

        debug!(
            "Merged response from {} for request {} (status {})",
            response.node_id, self.request_id, response.status
        );
        state.responses.insert(response.node_id.clone(), response);
        self.check_completion(&mut state);
        true
    }

    /// Whether every node reported or the aggregate timeout elapsed
    pub fn is_complete(&self) -> bool {
        let mut state = self.state.lock();
        self.check_completion(&mut state)
    }

    /// When the response completed, if it has
    pub fn completed_at(&self) -> Option<Instant> {
        let mut state = self.state.lock();
        self.check_completion(&mut state);
        state.completed_at
    }

    /// Number of nodes that have reported so far
    pub fn response_count(&self) -> usize {
        self.state.lock().responses.len()
    }

    fn check_completion(&self, state: &mut ResponseState) -> bool {
        if state.completed_at.is_some() {
            return true;
        }

        let now = Instant::now();
        let missing: Vec<&NodeIdentifier> = self
            .expected_nodes
            .iter()
            .filter(|node| !state.responses.contains_key(*node))
            .collect();

        if !missing.is_empty() {
            if now < self.deadline {
                return false;
            }

            warn!(
                "Request {} timed out after {:?} waiting for {} node(s)",
                self.request_id,
                self.timeout,
                missing.len()
            );
            for node in missing {
                state
                    .responses
                    .insert(node.clone(), NodeResponse::timeout(node.clone(), self.timeout));
            }
        }

        state.completed_at = Some(now);
        self.completion.notify_waiters();
        true
    }

    /// Current view of the response
    pub fn snapshot(&self) -> ClusterResponseSnapshot {
        let mut state = self.state.lock();
        let complete = self.check_completion(&mut state);

        let mut responses = Vec::with_capacity(state.responses.len());
        let mut pending_nodes = Vec::new();
        for node in &self.expected_nodes {
            match state.responses.get(node) {
                Some(response) => responses.push(response.clone()),
                None => pending_nodes.push(node.clone()),
            }
        }

        let status = if !complete {
            OverallStatus::Pending
        } else {
            match responses.iter().find(|r| !r.is_success()) {
                Some(failed) => OverallStatus::Failure {
                    node_id: failed.node_id.clone(),
                    status: failed.status,
                },
                None => OverallStatus::Success {
                    status: responses.first().map_or(200, |r| r.status),
                },
            }
        };

        ClusterResponseSnapshot {
            request_id: self.request_id.clone(),
            method: self.method.to_string(),
            uri: self.uri.clone(),
            complete,
            status,
            responses,
            pending_nodes,
        }
    }

    /// Wait until the response completes or `timeout` elapses
    ///
    /// Returns whether the response is complete.
    pub async fn wait_for_completion(&self, timeout: Duration) -> bool {
        let limit = instant_after(timeout);
        loop {
            let notified = self.completion.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_complete() {
                return true;
            }

            let wake = limit.min(self.deadline);
            if tokio::time::timeout_at(wake, notified).await.is_err() {
                return self.is_complete();
            }
        }
    }
}
