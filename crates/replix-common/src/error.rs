//! Error types for Replix
//!
//! `ReplicationError` is the error surface of the replication engine. Node-level
//! failures never appear here once a request has been dispatched; they are
//! recorded inside the per-node responses instead.

/// Replication engine errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    #[error("caused: {0}")]
    IllegalArgument(String),

    #[error("invalid replication target: {0}")]
    InvalidTarget(String),

    #[error("received a mutable request while node '{0}' is connecting to the cluster")]
    ConnectingNodeMutableRequest(String),

    #[error("received a mutable request while node '{0}' is disconnected from the cluster")]
    DisconnectedNodeMutableRequest(String),

    #[error("node '{node}' failed verification: {reason}")]
    VerificationFailed { node: String, reason: String },

    #[error("too many outstanding replication requests (limit {0})")]
    TooManyRequests(usize),

    #[error("replication service has been stopped")]
    ServiceStopped,

    #[error("node client error: {0}")]
    NodeClient(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ReplicationError {
    /// HTTP status a front end should answer with when surfacing this error
    pub fn http_status(&self) -> u16 {
        match self {
            ReplicationError::IllegalArgument(_) | ReplicationError::InvalidTarget(_) => 400,
            ReplicationError::ConnectingNodeMutableRequest(_)
            | ReplicationError::DisconnectedNodeMutableRequest(_)
            | ReplicationError::VerificationFailed { .. } => 409,
            ReplicationError::TooManyRequests(_) | ReplicationError::ServiceStopped => 503,
            ReplicationError::NodeClient(_) => 502,
            ReplicationError::Config(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReplicationError>;
