pub mod api;
pub mod auth;
pub mod balancer;
pub mod config;
pub mod error;
pub mod limits;
pub mod pricing;
pub mod proxy;
pub mod usage;
pub mod wildcard;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::balancer::health::spawn_health_monitor;
use crate::balancer::LoadBalancer;
use crate::config::{Config, ConfigError, ConfigStore};
use crate::usage::store::UsageStore;
use crate::usage::UsageRecord;

/// User agent for upstream requests and health probes.
pub const USER_AGENT: &str = concat!("ccgate/", env!("CARGO_PKG_VERSION"));

/// Connect timeout for the shared upstream client; per-request timeouts come
/// from `proxy.timeout`.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub client: reqwest::Client,
    pub balancer: Arc<RwLock<LoadBalancer>>,
    pub store: Arc<UsageStore>,
    pub usage_tx: mpsc::UnboundedSender<UsageRecord>,
    /// Running health-probe task, replaced on reload.
    pub health_task: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
    pub started: Instant,
}

/// Outcome of a successful reload, reported by the admin API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadSummary {
    pub upstreams: usize,
    pub tenants: usize,
    pub pricing_entries: usize,
}

impl AppState {
    /// Re-read the config directory, swap the snapshot, rebuild the balancer
    /// (fresh counters and round-robin index) and restart the probe loop.
    /// On failure the running configuration is untouched.
    pub async fn reload(&self) -> Result<ReloadSummary, ConfigError> {
        let fresh = self.config.reload().await?;
        *self.balancer.write().await = LoadBalancer::from_config(&fresh);
        self.restart_health_monitor(&fresh).await;
        Ok(ReloadSummary {
            upstreams: fresh.upstreams.len(),
            tenants: fresh.tenants.len(),
            pricing_entries: fresh.pricing.len(),
        })
    }

    /// Abort the current probe task and start one for the given snapshot
    /// (or none, when health checking is disabled).
    pub async fn restart_health_monitor(&self, config: &Config) {
        let mut slot = self.health_task.lock().await;
        if let Some(task) = slot.take() {
            task.abort();
        }
        if config.load_balancer.health_check_enabled {
            *slot = Some(spawn_health_monitor(
                self.balancer.clone(),
                self.client.clone(),
            ));
        }
    }
}

/// Shared upstream HTTP client. Compression stays off so proxied bytes are
/// forwarded exactly as received.
pub fn http_client() -> reqwest::Client {
    match reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to build HTTP client with custom config; using defaults");
            reqwest::Client::new()
        }
    }
}
