//! Replix Common - Shared error types and replication protocol constants
//!
//! This crate provides:
//! - `ReplicationError`, the error surface of the replication engine
//! - The headers exchanged between replicating and receiving nodes
//! - Helpers a receiving node uses to recognize replicated traffic

pub mod error;

use std::collections::HashMap;

pub use error::{ReplicationError, Result};

/// Carries the replication request identifier on every outbound node call
pub const REQUEST_TRANSACTION_ID_HEADER: &str = "X-RequestTransactionId";

/// Marks a request as already replicated so the receiver does not fan it out again
pub const REPLICATION_INDICATOR_HEADER: &str = "X-Request-Replicated";

/// Marks a request as a verification probe
pub const VALIDATION_EXPECTS_HEADER: &str = "X-Validation-Expects";
pub const VALIDATION_EXPECTS_VALUE: &str = "202-Accepted";

/// Identity chain of the user on whose behalf the request is replicated
pub const PROXIED_ENTITIES_CHAIN_HEADER: &str = "X-ProxiedEntitiesChain";

/// Seed shared by all nodes so that POST requests derive identical component ids
pub const CLUSTER_ID_GENERATION_SEED_HEADER: &str = "X-Cluster-Id-Generation-Seed";

/// Status a node answers to a verification probe when it can perform the request
pub const NODE_CONTINUE_STATUS: u16 = 202;

/// Synthetic status recorded when a node did not answer in time
pub const NODE_TIMEOUT_STATUS: u16 = 504;

/// Synthetic status recorded when a node could not be reached
pub const NODE_UNREACHABLE_STATUS: u16 = 503;

/// Headers that describe a single hop and are never replicated
pub const HOP_BY_HOP_HEADERS: &[&str] = &["host", "content-length", "transfer-encoding", "connection"];

/// Headers only the replicator may set on outbound node calls
pub const RESERVED_HEADERS: &[&str] = &[
    REQUEST_TRANSACTION_ID_HEADER,
    REPLICATION_INDICATOR_HEADER,
    VALIDATION_EXPECTS_HEADER,
    PROXIED_ENTITIES_CHAIN_HEADER,
];

fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Check whether an inbound request was sent by another node's replicator
pub fn is_replicated_request(headers: &HashMap<String, String>) -> bool {
    header_value(headers, REPLICATION_INDICATOR_HEADER)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Check whether an inbound request is a verification probe
pub fn is_verification_probe(headers: &HashMap<String, String>) -> bool {
    header_value(headers, VALIDATION_EXPECTS_HEADER)
        .is_some_and(|v| v.eq_ignore_ascii_case(VALIDATION_EXPECTS_VALUE))
}

/// Request identifier of an inbound replicated request, if present
pub fn request_transaction_id(headers: &HashMap<String, String>) -> Option<&str> {
    header_value(headers, REQUEST_TRANSACTION_ID_HEADER)
}

/// Check whether a header is hop-by-hop and must be dropped before replication
pub fn is_hop_by_hop_header(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Check whether a header belongs to the replication protocol and must not come from a caller
pub fn is_reserved_header(name: &str) -> bool {
    RESERVED_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_replicated_request() {
        let mut headers = HashMap::new();
        assert!(!is_replicated_request(&headers));

        headers.insert("x-request-replicated".to_string(), "TRUE".to_string());
        assert!(is_replicated_request(&headers));

        headers.insert("x-request-replicated".to_string(), "false".to_string());
        assert!(!is_replicated_request(&headers));
    }

    #[test]
    fn test_is_verification_probe() {
        let mut headers = HashMap::new();
        headers.insert(
            VALIDATION_EXPECTS_HEADER.to_string(),
            VALIDATION_EXPECTS_VALUE.to_string(),
        );
        assert!(is_verification_probe(&headers));
        assert!(!is_replicated_request(&headers));
    }

    #[test]
    fn test_request_transaction_id() {
        let mut headers = HashMap::new();
        headers.insert(
            REQUEST_TRANSACTION_ID_HEADER.to_string(),
            "abc-123".to_string(),
        );
        assert_eq!(request_transaction_id(&headers), Some("abc-123"));
    }

    #[test]
    fn test_is_hop_by_hop_header() {
        assert!(is_hop_by_hop_header("Content-Length"));
        assert!(is_hop_by_hop_header("host"));
        assert!(!is_hop_by_hop_header("Content-Type"));
    }

    #[test]
    fn test_is_reserved_header() {
        assert!(is_reserved_header("x-validation-expects"));
        assert!(is_reserved_header("X-REQUEST-REPLICATED"));
        assert!(is_reserved_header("x-requesttransactionid"));
        assert!(is_reserved_header("x-proxiedentitieschain"));
        assert!(!is_reserved_header(CLUSTER_ID_GENERATION_SEED_HEADER));
        assert!(!is_reserved_header("X-Trace"));
    }
}
