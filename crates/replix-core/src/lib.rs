//! Replix Core - Cluster request replication
//!
//! This crate provides:
//! - Fan-out of one request to every connected node or a chosen subset
//! - Verification of mutable requests before any node applies them
//! - Asynchronous aggregation of per-node responses
//! - A registry of outstanding responses polled by request identifier
//! - Forwarding of requests to the cluster coordinator

pub mod metrics;
pub mod model;
pub mod service;

// Re-export commonly used types
pub use model::{
    ActingUser, Configuration, NodeConnectionState, NodeFailure, NodeIdentifier, NodeResponse,
    ReplicationRequest,
};
pub use service::{
    AsyncClusterResponse, ClusterResponseSnapshot, HttpNodeClient, HttpNodeClientConfig,
    NodeClient, NodeDirectory, OverallStatus, ReplicationTarget, ReplicatorConfig,
    RequestCompletionCallback, RequestReplicator, StaticNodeDirectory,
};

pub use replix_common::{ReplicationError, Result};
pub use reqwest::Method;
