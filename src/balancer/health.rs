//! Periodic upstream health probing.
//!
//! One timer fans out concurrent GET probes to every enabled upstream; a
//! 200-399 response within the timeout marks it healthy, anything else
//! (status, error, timeout) marks it unhealthy. The first round runs
//! immediately at startup. A config reload aborts the running task and
//! spawns a fresh one against the new snapshot.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::balancer::LoadBalancer;
use crate::config::Upstream;

/// Time between probe rounds.
const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Per-probe timeout unless the upstream overrides it.
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_PROBE_PATH: &str = "/health";

/// Spawn the probe loop. Targets come from the shared balancer, so the loop
/// always probes the live upstream set; restarting it on reload resets the
/// schedule.
pub fn spawn_health_monitor(
    balancer: Arc<RwLock<LoadBalancer>>,
    client: reqwest::Client,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PROBE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            // The first tick fires immediately, so startup gets a probe round
            // before the first 30 s elapse.
            ticker.tick().await;

            let targets = balancer.read().await.probe_targets();
            if targets.is_empty() {
                continue;
            }

            let probes = targets.into_iter().map(|upstream| {
                let client = client.clone();
                async move {
                    let healthy = probe(&client, &upstream).await;
                    (upstream.id, healthy)
                }
            });
            let results = futures::future::join_all(probes).await;

            let mut balancer = balancer.write().await;
            for (id, healthy) in results {
                balancer.mark_health(&id, healthy);
            }
        }
    })
}

/// Issue one probe. Any transport error or non-2xx/3xx status is unhealthy.
async fn probe(client: &reqwest::Client, upstream: &Upstream) -> bool {
    let url = probe_url(upstream);
    let timeout = upstream
        .health_check
        .as_ref()
        .and_then(|hc| hc.timeout)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_PROBE_TIMEOUT);

    match client.get(&url).timeout(timeout).send().await {
        Ok(response) => {
            let code = response.status().as_u16();
            let healthy = (200..400).contains(&code);
            if !healthy {
                tracing::debug!(upstream_id = %upstream.id, status = code, "Probe returned error status");
            }
            healthy
        }
        Err(e) => {
            tracing::debug!(upstream_id = %upstream.id, error = %e, "Probe failed");
            false
        }
    }
}

/// `{upstream.url}{healthCheck.path || "/health"}`, normalizing slashes.
fn probe_url(upstream: &Upstream) -> String {
    let path = upstream
        .health_check
        .as_ref()
        .and_then(|hc| hc.path.as_deref())
        .unwrap_or(DEFAULT_PROBE_PATH);
    let base = upstream.url.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
