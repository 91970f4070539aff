//! Command line arguments and configuration loading.
//!
//! Precedence, lowest first: built-in defaults, the configuration file,
//! `REPLIX__*` environment variables, then command line flags.

use std::{collections::BTreeSet, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, anyhow, bail};
use clap::Parser;
use config::{Config, Environment, File};

use replix_core::{
    ActingUser, Configuration, Method, NodeIdentifier, ReplicationRequest, ReplicationTarget,
};

/// Replicate one request to the nodes of a cluster and print the merged result
#[derive(Debug, Parser)]
#[command(name = "replix", version, about)]
pub struct Cli {
    /// Target URI path, e.g. /api/flow/process-groups/root
    pub uri: String,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short = 'c', long = "config", env = "REPLIX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Cluster node as `id@host:port`; repeat or separate with commas
    #[arg(short = 'n', long = "node", env = "REPLIX_NODES", value_delimiter = ',')]
    pub nodes: Vec<String>,

    /// HTTP method
    #[arg(short = 'X', long = "method", default_value = "GET")]
    pub method: String,

    /// JSON entity sent with the request
    #[arg(short = 'd', long = "data")]
    pub data: Option<String>,

    /// Extra request header as `name: value`
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Replicate only to these node ids instead of every connected node
    #[arg(short = 't', long = "target", conflicts_with = "forward_to")]
    pub targets: Vec<String>,

    /// Forward the request to this coordinator (`id@host:port`) instead of replicating it
    #[arg(long = "forward-to")]
    pub forward_to: Option<String>,

    /// Skip the verification round for mutable requests
    #[arg(long = "no-verify")]
    pub no_verify: bool,

    /// Do not mark outbound requests as replicated; forwarded requests never carry the marker
    #[arg(long = "no-replicated-marker")]
    pub no_replicated_marker: bool,

    /// Identity of the acting user
    #[arg(short = 'u', long = "user")]
    pub user: Option<String>,

    /// Proxy identities the request passed through, in order
    #[arg(long = "proxy", requires = "user")]
    pub proxies: Vec<String>,

    /// Per-node request timeout in milliseconds
    #[arg(long = "request-timeout", env = "REPLIX_REQUEST_TIMEOUT")]
    pub request_timeout_ms: Option<u64>,

    /// Aggregate response timeout in milliseconds
    #[arg(long = "response-timeout", env = "REPLIX_RESPONSE_TIMEOUT")]
    pub response_timeout_ms: Option<u64>,

    /// Interval between polls for the cluster response in milliseconds
    #[arg(long = "poll-interval", default_value_t = 100)]
    pub poll_interval_ms: u64,

    /// Directory for the rolling log file
    #[arg(long = "log-dir", env = "REPLIX_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long = "log-level", env = "REPLIX_LOG_LEVEL")]
    pub log_level: Option<String>,
}

fn parse_header(value: &str) -> Result<(String, String), String> {
    let (name, value) = value
        .split_once(':')
        .ok_or_else(|| format!("header '{}' is not in 'name: value' form", value))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("header name is empty".to_string());
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// `REPLIX__NODE__SCHEME` maps to `replix.node.scheme`; other variables are ignored
fn environment() -> Environment {
    Environment::with_prefix("REPLIX")
        .prefix_separator("__")
        .separator("__")
        .keep_prefix(true)
        .try_parsing(true)
}

impl Cli {
    /// Build the application configuration for this invocation
    pub fn load_configuration(&self) -> anyhow::Result<Configuration> {
        let mut builder = Config::builder();

        if let Some(path) = &self.config {
            builder = builder.add_source(File::from(path.as_path()).required(true));
        }

        builder = builder.add_source(environment());

        if !self.nodes.is_empty() {
            builder = builder.set_override("replix.cluster.nodes", self.nodes.join(","))?;
        }
        if let Some(ms) = self.request_timeout_ms {
            builder = builder.set_override("replix.replication.request-timeout", ms)?;
        }
        if let Some(ms) = self.response_timeout_ms {
            builder = builder.set_override("replix.replication.response-timeout", ms)?;
        }
        if let Some(dir) = &self.log_dir {
            builder = builder.set_override("replix.logs.path", dir.display().to_string())?;
        }
        if let Some(level) = &self.log_level {
            builder = builder.set_override("replix.logs.level", level.as_str())?;
        }

        let config = builder.build().context("failed to load configuration")?;
        Ok(Configuration::from_config(config))
    }

    /// The request described by the flags
    pub fn replication_request(&self) -> anyhow::Result<ReplicationRequest> {
        let method = Method::from_str(&self.method.to_uppercase())
            .with_context(|| format!("invalid method {}", self.method))?;

        let mut request = ReplicationRequest::new(method, self.uri.as_str())?
            .perform_verification(!self.no_verify)
            .indicate_replicated(!self.no_replicated_marker);

        if let Some(data) = &self.data {
            let entity: serde_json::Value =
                serde_json::from_str(data).context("request entity is not valid JSON")?;
            request = request
                .with_header("Content-Type", "application/json")
                .with_entity(entity);
        }

        for (name, value) in &self.headers {
            request = request.with_header(name.as_str(), value.as_str());
        }

        if let Some(identity) = &self.user {
            let user = self
                .proxies
                .iter()
                .fold(ActingUser::new(identity.as_str()), |user, proxy| {
                    user.with_proxy(proxy.as_str())
                });
            request = request.with_user(user);
        }

        Ok(request)
    }

    /// Where the request goes, resolving `--target` ids against the configured nodes
    pub fn target(&self, cluster_nodes: &[NodeIdentifier]) -> anyhow::Result<ReplicationTarget> {
        if let Some(coordinator) = &self.forward_to {
            let coordinator = NodeIdentifier::from_str(coordinator)
                .with_context(|| format!("invalid coordinator {}", coordinator))?;
            return Ok(ReplicationTarget::Coordinator(coordinator));
        }

        if self.targets.is_empty() {
            return Ok(ReplicationTarget::AllConnected);
        }

        let mut nodes = BTreeSet::new();
        for id in &self.targets {
            let node = cluster_nodes
                .iter()
                .find(|n| &n.id == id)
                .ok_or_else(|| anyhow!("target {} is not a configured cluster node", id))?;
            nodes.insert(node.clone());
        }
        Ok(ReplicationTarget::Nodes(nodes))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Fail early on flag combinations that can never succeed
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.forward_to.is_none() && self.nodes.is_empty() && self.config.is_none() {
            bail!("no cluster nodes given; use --node, --config or --forward-to");
        }
        Ok(())
    }
}
