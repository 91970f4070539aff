//! Main entry point for the replix command line client.
//!
//! Replicates one request to the configured cluster, polls until every node
//! has answered or the response timed out, then prints the merged response
//! as JSON on stdout.

use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{debug, info};

use replix_cli::{
    Cli,
    startup::{self, LoggingConfig},
};
use replix_core::{
    ClusterResponseSnapshot, HttpNodeClient, HttpNodeClientConfig, ReplicatorConfig,
    RequestReplicator, StaticNodeDirectory,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.validate()?;

    let configuration = cli.load_configuration()?;
    let _logging_guard = startup::init_logging(&LoggingConfig::from_configuration(&configuration))?;

    replix_core::metrics::describe_metrics();

    let nodes = configuration
        .cluster_nodes()
        .context("invalid cluster node list")?;
    info!("Cluster has {} configured node(s)", nodes.len());

    let target = cli.target(&nodes)?;
    let request = cli.replication_request()?;

    let directory = Arc::new(StaticNodeDirectory::connected(nodes));
    let client = Arc::new(HttpNodeClient::new(HttpNodeClientConfig::from_configuration(
        &configuration,
    ))?);
    let replicator = RequestReplicator::new(
        directory,
        client,
        ReplicatorConfig::from_configuration(&configuration),
    );

    let response = replicator.replicate(target, request).await?;
    let request_id = response.request_id().to_string();
    drop(response);
    info!("Request {} dispatched", request_id);

    let snapshot = poll_until_complete(&replicator, &request_id, cli.poll_interval()).await;
    replicator.shutdown();

    let snapshot = snapshot?;
    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).context("failed to serialize cluster response")?
    );

    if !snapshot.is_success() {
        bail!("request {} did not succeed on every node", request_id);
    }
    Ok(())
}

async fn poll_until_complete(
    replicator: &RequestReplicator,
    request_id: &str,
    interval: std::time::Duration,
) -> anyhow::Result<ClusterResponseSnapshot> {
    loop {
        let Some(response) = replicator.get_cluster_response(request_id) else {
            bail!("cluster response {} is no longer available", request_id);
        };

        if response.is_complete() {
            return Ok(response.snapshot());
        }

        let snapshot = response.snapshot();
        debug!(
            "Request {}: {}/{} node(s) answered",
            request_id,
            snapshot.responses.len(),
            response.expected_nodes().len()
        );
        tokio::time::sleep(interval).await;
    }
}
