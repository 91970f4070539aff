// Node client for replicated calls
// Builds the outbound request sent to each node and performs it over HTTP

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Method};
use tracing::debug;

use replix_common::{
    CLUSTER_ID_GENERATION_SEED_HEADER, PROXIED_ENTITIES_CHAIN_HEADER, REPLICATION_INDICATOR_HEADER,
    REQUEST_TRANSACTION_ID_HEADER, ReplicationError, Result, VALIDATION_EXPECTS_HEADER,
    VALIDATION_EXPECTS_VALUE,
};

use crate::model::{Configuration, NodeIdentifier, ReplicationRequest};

/// The request as it goes out to one node, protocol headers included
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundRequest {
    pub request_id: String,
    pub method: Method,
    pub uri: String,
    pub entity: Option<serde_json::Value>,
    pub headers: HashMap<String, String>,
}

impl OutboundRequest {
    /// Build the outbound form of a replication request
    pub fn from_replication(request_id: &str, request: &ReplicationRequest) -> Self {
        let mut headers = request.headers().clone();

        headers.insert(
            REQUEST_TRANSACTION_ID_HEADER.to_string(),
            request_id.to_string(),
        );

        if request.is_indicate_replicated() {
            headers.insert(REPLICATION_INDICATOR_HEADER.to_string(), "true".to_string());
        }

        if let Some(user) = request.user() {
            headers.insert(
                PROXIED_ENTITIES_CHAIN_HEADER.to_string(),
                user.proxied_entities_chain(),
            );
        }

        // Every node must derive the same ids for components created by this request
        if *request.method() == Method::POST
            && !headers
                .keys()
                .any(|k| k.eq_ignore_ascii_case(CLUSTER_ID_GENERATION_SEED_HEADER))
        {
            headers.insert(
                CLUSTER_ID_GENERATION_SEED_HEADER.to_string(),
                uuid::Uuid::new_v4().to_string(),
            );
        }

        Self {
            request_id: request_id.to_string(),
            method: request.method().clone(),
            uri: request.uri().to_string(),
            entity: request.entity().cloned(),
            headers,
        }
    }

    /// The same request marked as a verification probe
    pub fn verification_probe(&self) -> Self {
        let mut probe = self.clone();
        probe.headers.insert(
            VALIDATION_EXPECTS_HEADER.to_string(),
            VALIDATION_EXPECTS_VALUE.to_string(),
        );
        probe
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Raw reply of one node
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeReply {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl NodeReply {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// Performs one request against one node
///
/// Errors describe transport failures only; any HTTP status is a successful reply.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn send(&self, node_id: &NodeIdentifier, request: &OutboundRequest) -> Result<NodeReply>;
}

/// Configuration for the HTTP node client
#[derive(Clone, Debug)]
pub struct HttpNodeClientConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Request timeout
    pub request_timeout: Duration,
    /// URL scheme of node APIs
    pub scheme: String,
}

impl Default for HttpNodeClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            scheme: "http".to_string(),
        }
    }
}

impl HttpNodeClientConfig {
    /// Create a HttpNodeClientConfig from application Configuration
    pub fn from_configuration(config: &Configuration) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms()),
            request_timeout: Duration::from_millis(config.request_timeout_ms()),
            scheme: config.node_scheme(),
        }
    }
}

/// Whether the entity of a request travels as query parameters instead of a body
fn sends_entity_as_query(method: &Method) -> bool {
    *method == Method::GET
        || *method == Method::HEAD
        || *method == Method::OPTIONS
        || *method == Method::DELETE
}

fn query_pairs(entity: &serde_json::Map<String, serde_json::Value>) -> Vec<(String, String)> {
    fn render(value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    let mut pairs = Vec::new();
    for (key, value) in entity {
        match value {
            serde_json::Value::Null => {}
            serde_json::Value::Array(values) => {
                pairs.extend(values.iter().map(|v| (key.clone(), render(v))));
            }
            other => pairs.push((key.clone(), render(other))),
        }
    }
    pairs
}

/// reqwest-backed node client
#[derive(Clone, Debug)]
pub struct HttpNodeClient {
    client: Client,
    config: HttpNodeClientConfig,
}

impl HttpNodeClient {
    pub fn new(config: HttpNodeClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ReplicationError::Config(format!("failed to build http client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn build_url(&self, node_id: &NodeIdentifier, uri: &str) -> String {
        format!(
            "{}://{}:{}{}",
            self.config.scheme, node_id.api_host, node_id.api_port, uri
        )
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn send(&self, node_id: &NodeIdentifier, request: &OutboundRequest) -> Result<NodeReply> {
        let url = self.build_url(node_id, &request.uri);
        debug!(
            "Sending {} {} to node {} (request {})",
            request.method, url, node_id, request.request_id
        );

        let mut builder = self.client.request(request.method.clone(), &url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        if let Some(entity) = &request.entity {
            if sends_entity_as_query(&request.method) {
                if let Some(params) = entity.as_object() {
                    builder = builder.query(&query_pairs(params));
                }
            } else {
                builder = builder.json(entity);
            }
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ReplicationError::NodeClient(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| ReplicationError::NodeClient(e.to_string()))?;

        Ok(NodeReply {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActingUser;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, header, method, path, query_param},
    };

    fn server_node(server: &MockServer) -> NodeIdentifier {
        let addr = server.address();
        NodeIdentifier::new("n1", addr.ip().to_string(), addr.port())
    }

    #[test]
    fn test_outbound_request_headers() {
        let request = ReplicationRequest::new(Method::PUT, "/api/flow")
            .unwrap()
            .with_header("Content-Type", "application/json")
            .with_user(ActingUser::new("alice").with_proxy("proxy"));

        let outbound = OutboundRequest::from_replication("req-1", &request);
        assert_eq!(outbound.header(REQUEST_TRANSACTION_ID_HEADER), Some("req-1"));
        assert_eq!(outbound.header(REPLICATION_INDICATOR_HEADER), Some("true"));
        assert_eq!(
            outbound.header(PROXIED_ENTITIES_CHAIN_HEADER),
            Some("<alice><proxy>")
        );
        assert_eq!(outbound.header("content-type"), Some("application/json"));
        assert!(outbound.header(CLUSTER_ID_GENERATION_SEED_HEADER).is_none());
        assert!(outbound.header(VALIDATION_EXPECTS_HEADER).is_none());

        let probe = outbound.verification_probe();
        assert_eq!(
            probe.header(VALIDATION_EXPECTS_HEADER),
            Some(VALIDATION_EXPECTS_VALUE)
        );
    }

    #[test]
    fn test_outbound_request_without_replication_marker() {
        let request = ReplicationRequest::new(Method::POST, "/api/processors")
            .unwrap()
            .indicate_replicated(false);

        let outbound = OutboundRequest::from_replication("req-2", &request);
        assert!(outbound.header(REPLICATION_INDICATOR_HEADER).is_none());
        assert!(outbound.header(CLUSTER_ID_GENERATION_SEED_HEADER).is_some());
    }

    #[test]
    fn test_forged_protocol_headers_do_not_reach_nodes() {
        let request = ReplicationRequest::new(Method::PUT, "/api/flow")
            .unwrap()
            .with_header("x-validation-expects", VALIDATION_EXPECTS_VALUE)
            .with_header("x-request-replicated", "false")
            .with_header("x-requesttransactionid", "forged");

        let outbound = OutboundRequest::from_replication("req-3", &request);
        assert!(!replix_common::is_verification_probe(&outbound.headers));
        assert!(replix_common::is_replicated_request(&outbound.headers));
        assert_eq!(
            replix_common::request_transaction_id(&outbound.headers),
            Some("req-3")
        );
        assert_eq!(outbound.headers.len(), 2);
    }

    #[test]
    fn test_query_pairs() {
        let entity = serde_json::json!({
            "recursive": true,
            "name": "flow",
            "ids": ["a", "b"],
            "skip": null,
        });
        let mut pairs = query_pairs(entity.as_object().unwrap());
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("ids".to_string(), "a".to_string()),
                ("ids".to_string(), "b".to_string()),
                ("name".to_string(), "flow".to_string()),
                ("recursive".to_string(), "true".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_http_node_client_sends_body_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/flow"))
            .and(header(REPLICATION_INDICATOR_HEADER, "true"))
            .and(body_json(serde_json::json!({"state": "RUNNING"})))
            .respond_with(ResponseTemplate::new(200).set_body_string("updated"))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpNodeClient::new(HttpNodeClientConfig::default()).unwrap();
        let request = ReplicationRequest::new(Method::PUT, "/api/flow")
            .unwrap()
            .with_entity(serde_json::json!({"state": "RUNNING"}));
        let outbound = OutboundRequest::from_replication("req-3", &request);

        let reply = client.send(&server_node(&server), &outbound).await.unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, Bytes::from_static(b"updated"));
    }

    #[tokio::test]
    async fn test_http_node_client_sends_query_for_get() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/flow/status"))
            .and(query_param("recursive", "true"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpNodeClient::new(HttpNodeClientConfig::default()).unwrap();
        let request = ReplicationRequest::new(Method::GET, "/api/flow/status")
            .unwrap()
            .with_entity(serde_json::json!({"recursive": true}));
        let outbound = OutboundRequest::from_replication("req-4", &request);

        let reply = client.send(&server_node(&server), &outbound).await.unwrap();
        assert_eq!(reply.status, 404);
    }

    #[tokio::test]
    async fn test_http_node_client_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = HttpNodeClient::new(HttpNodeClientConfig {
            request_timeout: Duration::from_millis(50),
            ..Default::default()
        })
        .unwrap();
        let request = ReplicationRequest::new(Method::GET, "/api/flow").unwrap();
        let outbound = OutboundRequest::from_replication("req-5", &request);

        let result = client.send(&server_node(&server), &outbound).await;
        assert!(matches!(result, Err(ReplicationError::NodeClient(_))));
    }
}
