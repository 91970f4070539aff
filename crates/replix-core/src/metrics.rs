// Metrics for request replication
// Names and descriptions of the counters, gauges and histograms emitted by the engine

use metrics::{describe_counter, describe_gauge, describe_histogram};

pub const REPLICATION_REQUESTS_TOTAL: &str = "replication_requests_total";
pub const REPLICATION_REJECTED_TOTAL: &str = "replication_rejected_total";
pub const REPLICATION_VERIFICATIONS_TOTAL: &str = "replication_verifications_total";
pub const REPLICATION_NODE_FAILURES_TOTAL: &str = "replication_node_failures_total";
pub const REPLICATION_NODE_LATENCY_SECONDS: &str = "replication_node_latency_seconds";
pub const REPLICATION_OUTSTANDING_REQUESTS: &str = "replication_outstanding_requests";

/// Initialize all metric descriptions
/// Should be called once at application startup
pub fn describe_metrics() {
    describe_counter!(
        REPLICATION_REQUESTS_TOTAL,
        "Total number of requests accepted for replication"
    );
    describe_counter!(
        REPLICATION_REJECTED_TOTAL,
        "Total number of replication requests rejected before dispatch"
    );
    describe_counter!(
        REPLICATION_VERIFICATIONS_TOTAL,
        "Total number of verification rounds run for mutable requests"
    );
    describe_counter!(
        REPLICATION_NODE_FAILURES_TOTAL,
        "Total number of node calls that failed, timed out or returned a non-2xx status"
    );
    describe_histogram!(
        REPLICATION_NODE_LATENCY_SECONDS,
        "Latency of individual node calls in seconds"
    );
    describe_gauge!(
        REPLICATION_OUTSTANDING_REQUESTS,
        "Number of cluster responses held by the registry"
    );
}
