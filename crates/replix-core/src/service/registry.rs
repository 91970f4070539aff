// Response registry
// Holds in-flight and recently completed cluster responses keyed by request identifier

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info};

use replix_common::{ReplicationError, Result};

use super::response::AsyncClusterResponse;
use crate::model::Configuration;

/// Configuration for the response registry
#[derive(Clone, Debug)]
pub struct ResponseRegistryConfig {
    /// Maximum number of responses held at once
    pub max_outstanding: usize,
    /// How long a completed response stays retrievable if nobody polls it
    pub retention: Duration,
    /// Interval between sweeps for expired responses
    pub sweep_interval: Duration,
}

impl Default for ResponseRegistryConfig {
    fn default() -> Self {
        Self {
            max_outstanding: 100,
            retention: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl ResponseRegistryConfig {
    /// Create a ResponseRegistryConfig from application Configuration
    pub fn from_configuration(config: &Configuration) -> Self {
        Self {
            max_outstanding: config.max_concurrent_requests(),
            retention: Duration::from_millis(config.retention_ms()),
            sweep_interval: Duration::from_millis(config.sweep_interval_ms()),
        }
    }
}

struct RegistryEntry {
    response: Arc<AsyncClusterResponse>,
    /// Last time a caller looked the entry up - uses a mutex since Instant is not atomic
    last_touched: Mutex<Instant>,
}

impl RegistryEntry {
    fn touch(&self) {
        *self.last_touched.lock() = Instant::now();
    }

    /// Complete and untouched for at least `retention`
    fn is_expired(&self, now: Instant, retention: Duration) -> bool {
        match self.response.completed_at() {
            Some(completed_at) => {
                let since = completed_at.max(*self.last_touched.lock());
                now.saturating_duration_since(since) >= retention
            }
            None => false,
        }
    }
}

/// Registry of cluster responses
///
/// Eviction happens on the first lookup that observes completion. A periodic
/// sweep removes completed responses nobody polled once the retention window
/// has passed.
pub struct ResponseRegistry {
    config: ResponseRegistryConfig,
    entries: DashMap<String, RegistryEntry>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ResponseRegistry {
    pub fn new(config: ResponseRegistryConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Register a response before its requests are dispatched
    pub fn register(&self, response: Arc<AsyncClusterResponse>) -> Result<()> {
        if self.entries.len() >= self.config.max_outstanding {
            self.purge_expired();
            if self.entries.len() >= self.config.max_outstanding {
                return Err(ReplicationError::TooManyRequests(
                    self.config.max_outstanding,
                ));
            }
        }

        let request_id = response.request_id().to_string();
        match self.entries.entry(request_id) {
            Entry::Occupied(e) => Err(ReplicationError::IllegalArgument(format!(
                "request {} is already registered",
                e.key()
            ))),
            Entry::Vacant(e) => {
                debug!("Registered cluster response {}", e.key());
                e.insert(RegistryEntry {
                    response,
                    last_touched: Mutex::new(Instant::now()),
                });
                Ok(())
            }
        }
    }

    /// Look up a response; a completed response is evicted by this call
    pub fn get(&self, request_id: &str) -> Option<Arc<AsyncClusterResponse>> {
        let response = {
            let entry = self.entries.get(request_id)?;
            entry.touch();
            entry.response.clone()
        };

        if response.is_complete()
            && self
                .entries
                .remove_if(request_id, |_, e| Arc::ptr_eq(&e.response, &response))
                .is_some()
        {
            debug!("Evicted completed cluster response {}", request_id);
        }

        Some(response)
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove completed responses older than the retention window
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let retention = self.config.retention;
        let before = self.entries.len();

        self.entries.retain(|request_id, entry| {
            let expired = entry.is_expired(now, retention);
            if expired {
                debug!("Purging expired cluster response {}", request_id);
            }
            !expired
        });

        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            info!(
                "Purged {} expired cluster responses (retention: {:?})",
                removed, retention
            );
        }
        removed
    }

    /// Start the background sweep; calling it again replaces the running task
    pub fn start_sweeper(self: &Arc<Self>) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let sweep_interval = self.config.sweep_interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                match registry.upgrade() {
                    Some(registry) => {
                        registry.purge_expired();
                    }
                    None => break,
                }
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the sweep and drop every held response
    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        let dropped = self.entries.len();
        self.entries.clear();
        info!("Stopped response registry, dropped {} responses", dropped);
    }
}

impl Drop for ResponseRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ResponseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseRegistry")
            .field("config", &self.config)
            .field("entries", &self.entries.len())
            .finish()
    }
}
