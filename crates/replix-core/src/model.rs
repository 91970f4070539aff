// Core data models for request replication
// Node identities, replication requests, per-node responses and the configuration wrapper

use std::{borrow::Cow, collections::BTreeMap, collections::HashMap, fmt, str::FromStr, time::Duration};

use bytes::Bytes;
use reqwest::Method;
use serde::{Deserialize, Serialize, Serializer};

use replix_common::{
    NODE_TIMEOUT_STATUS, NODE_UNREACHABLE_STATUS, ReplicationError, Result, is_hop_by_hop_header,
    is_reserved_header,
};

/// Identity of one cluster member
///
/// Ordering is by identifier, then API host, then API port. Snapshots rely on
/// this ordering to pick the reported failure deterministically.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentifier {
    pub id: String,
    pub api_host: String,
    pub api_port: u16,
}

impl NodeIdentifier {
    pub fn new(id: impl Into<String>, api_host: impl Into<String>, api_port: u16) -> Self {
        Self {
            id: id.into(),
            api_host: api_host.into(),
            api_port,
        }
    }

    /// `host:port` of the node's API endpoint
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}

impl fmt::Display for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.id, self.api_host, self.api_port)
    }
}

/// Parses `id@host:port`, or `host:port` in which case the address doubles as the id
impl FromStr for NodeIdentifier {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (id, address) = match s.split_once('@') {
            Some((id, address)) => (id.trim(), address.trim()),
            None => (s, s),
        };

        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| ReplicationError::IllegalArgument(format!("invalid node address: {}", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ReplicationError::IllegalArgument(format!("invalid node port: {}", s)))?;

        if id.is_empty() || host.is_empty() {
            return Err(ReplicationError::IllegalArgument(format!(
                "invalid node identifier: {}",
                s
            )));
        }

        Ok(NodeIdentifier::new(id, host, port))
    }
}

/// Connectivity of a node as reported by the node directory
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl NodeConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeConnectionState::Connecting => "CONNECTING",
            NodeConnectionState::Connected => "CONNECTED",
            NodeConnectionState::Disconnecting => "DISCONNECTING",
            NodeConnectionState::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for NodeConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeConnectionState {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CONNECTING" => Ok(NodeConnectionState::Connecting),
            "CONNECTED" => Ok(NodeConnectionState::Connected),
            "DISCONNECTING" => Ok(NodeConnectionState::Disconnecting),
            "DISCONNECTED" => Ok(NodeConnectionState::Disconnected),
            _ => Err(ReplicationError::IllegalArgument(format!(
                "unknown node connection state: {}",
                s
            ))),
        }
    }
}

/// The user on whose behalf a request is replicated
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActingUser {
    pub identity: String,
    /// Proxies the request travelled through, closest to the user first
    pub proxies: Vec<String>,
}

impl ActingUser {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            proxies: Vec::new(),
        }
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxies.push(proxy.into());
        self
    }

    /// Render the chain as `<identity><proxy1><proxy2>`, escaping angle brackets
    pub fn proxied_entities_chain(&self) -> String {
        std::iter::once(&self.identity)
            .chain(self.proxies.iter())
            .map(|e| format!("<{}>", e.replace('<', "\\<").replace('>', "\\>")))
            .collect()
    }
}

/// Methods that never change state on the receiving node
pub fn is_read_only_method(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD || *method == Method::OPTIONS
}

/// One logical request to replicate across the cluster
#[derive(Clone, Debug)]
pub struct ReplicationRequest {
    method: Method,
    uri: String,
    entity: Option<serde_json::Value>,
    headers: HashMap<String, String>,
    user: Option<ActingUser>,
    indicate_replicated: bool,
    perform_verification: bool,
}

impl ReplicationRequest {
    /// Create a request for `uri`, a path without query string
    ///
    /// Replicated requests are marked as replicated and verified by default.
    pub fn new(method: Method, uri: impl Into<String>) -> Result<Self> {
        let uri = uri.into();
        if !uri.starts_with('/') {
            return Err(ReplicationError::IllegalArgument(format!(
                "request uri must be an absolute path: {}",
                uri
            )));
        }
        if uri.contains('?') {
            return Err(ReplicationError::IllegalArgument(format!(
                "request uri must not contain a query string: {}",
                uri
            )));
        }

        Ok(Self {
            method,
            uri,
            entity: None,
            headers: HashMap::new(),
            user: None,
            indicate_replicated: true,
            perform_verification: true,
        })
    }

    pub fn with_entity(mut self, entity: serde_json::Value) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Add a header; hop-by-hop and replication protocol headers are dropped
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        if !is_hop_by_hop_header(&name) && !is_reserved_header(&name) {
            self.headers.insert(name, value.into());
        }
        self
    }

    pub fn with_user(mut self, user: ActingUser) -> Self {
        self.user = Some(user);
        self
    }

    pub fn indicate_replicated(mut self, indicate_replicated: bool) -> Self {
        self.indicate_replicated = indicate_replicated;
        self
    }

    pub fn perform_verification(mut self, perform_verification: bool) -> Self {
        self.perform_verification = perform_verification;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn entity(&self) -> Option<&serde_json::Value> {
        self.entity.as_ref()
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn user(&self) -> Option<&ActingUser> {
        self.user.as_ref()
    }

    pub fn is_indicate_replicated(&self) -> bool {
        self.indicate_replicated
    }

    pub fn is_perform_verification(&self) -> bool {
        self.perform_verification
    }

    /// Whether the request changes state on the receiving nodes
    pub fn is_mutable(&self) -> bool {
        !is_read_only_method(&self.method)
    }
}

/// Why a node produced no real reply
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "camelCase")]
pub enum NodeFailure {
    Timeout,
    Transport(String),
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeFailure::Timeout => write!(f, "timed out"),
            NodeFailure::Transport(reason) => write!(f, "transport error: {}", reason),
        }
    }
}

fn serialize_body<S: Serializer>(body: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(body))
}

fn serialize_millis<S: Serializer>(
    latency: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(latency.as_millis() as u64)
}

/// Normalized outcome of one node's part in a replicated request
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResponse {
    pub node_id: NodeIdentifier,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    #[serde(serialize_with = "serialize_body")]
    pub body: Bytes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<NodeFailure>,
    #[serde(rename = "latencyMs", serialize_with = "serialize_millis")]
    pub latency: Duration,
}

impl NodeResponse {
    pub fn new(
        node_id: NodeIdentifier,
        status: u16,
        headers: BTreeMap<String, String>,
        body: Bytes,
        latency: Duration,
    ) -> Self {
        Self {
            node_id,
            status,
            headers,
            body,
            failure: None,
            latency,
        }
    }

    /// Synthetic response for a node that did not answer in time
    pub fn timeout(node_id: NodeIdentifier, latency: Duration) -> Self {
        Self {
            node_id,
            status: NODE_TIMEOUT_STATUS,
            headers: BTreeMap::new(),
            body: Bytes::new(),
            failure: Some(NodeFailure::Timeout),
            latency,
        }
    }

    /// Synthetic response for a node that could not be reached
    pub fn unreachable(node_id: NodeIdentifier, reason: impl Into<String>, latency: Duration) -> Self {
        Self {
            node_id,
            status: NODE_UNREACHABLE_STATUS,
            headers: BTreeMap::new(),
            body: Bytes::new(),
            failure: Some(NodeFailure::Transport(reason.into())),
            latency,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none() && (200..300).contains(&self.status)
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Application configuration wrapper
/// Provides typed access to replication settings with defaults
#[derive(Clone, Debug)]
pub struct Configuration {
    pub config: config::Config,
}

impl Configuration {
    /// Create a new configuration from a Config instance
    pub fn from_config(config: config::Config) -> Self {
        Self { config }
    }

    fn get_millis(&self, key: &str, default: u64) -> u64 {
        self.config
            .get_int(key)
            .ok()
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(default)
    }

    /// Node connect timeout in milliseconds (default: 5000ms)
    pub fn connect_timeout_ms(&self) -> u64 {
        self.get_millis("replix.replication.connect-timeout", 5000)
    }

    /// Per-node request timeout in milliseconds (default: 30000ms)
    pub fn request_timeout_ms(&self) -> u64 {
        self.get_millis("replix.replication.request-timeout", 30000)
    }

    /// Aggregate timeout after which a cluster response completes with missing nodes (default: 60000ms)
    pub fn response_timeout_ms(&self) -> u64 {
        self.get_millis("replix.replication.response-timeout", 60000)
    }

    /// Timeout for the whole verification round (default: 10000ms)
    pub fn verification_timeout_ms(&self) -> u64 {
        self.get_millis("replix.replication.verification-timeout", 10000)
    }

    /// Maximum number of outstanding cluster responses (default: 100)
    pub fn max_concurrent_requests(&self) -> usize {
        self.config
            .get_int("replix.replication.max-concurrent-requests")
            .ok()
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(100)
    }

    /// Maximum number of in-flight node calls (default: 20)
    pub fn worker_pool_size(&self) -> usize {
        self.config
            .get_int("replix.replication.worker-pool-size")
            .ok()
            .and_then(|v| usize::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(20)
    }

    /// How long a completed, unpolled response is retained in milliseconds (default: 30000ms)
    pub fn retention_ms(&self) -> u64 {
        self.get_millis("replix.replication.retention", 30000)
    }

    /// Registry sweep interval in milliseconds (default: 5000ms)
    pub fn sweep_interval_ms(&self) -> u64 {
        self.get_millis("replix.replication.sweep-interval", 5000)
    }

    /// URL scheme used to reach node APIs (default: http)
    pub fn node_scheme(&self) -> String {
        self.config
            .get_string("replix.node.scheme")
            .unwrap_or_else(|_| "http".to_string())
    }

    /// Statically configured cluster nodes
    pub fn cluster_nodes(&self) -> Result<Vec<NodeIdentifier>> {
        match self.config.get_string("replix.cluster.nodes") {
            Ok(nodes) => nodes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(NodeIdentifier::from_str)
                .collect(),
            Err(_) => Ok(Vec::new()),
        }
    }
}
