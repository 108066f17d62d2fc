//! Muscle health prober
//!
//! Polls the agent's `GetSystemStatus` and keeps the latest result in a
//! shared cache. The brain reports itself unhealthy when the link to the
//! Muscle is severed: unhealthy until the first successful probe, and
//! again once the last success is no longer recent.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use kari_proto::SystemStatus;
use tracing::{debug, error, info};

use crate::ports::Agent;

/// Probe cadence.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(15);

/// Per-probe timeout, independent of request deadlines.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A probe older than this no longer counts as recent for /healthz.
pub const RECENCY_WINDOW: Duration = Duration::from_secs(45);

#[derive(Default)]
struct CacheState {
    healthy: bool,
    status: Option<SystemStatus>,
    last_success: Option<Instant>,
}

/// Shared view of the Muscle's last known state.
#[derive(Default)]
pub struct HealthCache {
    state: RwLock<CacheState>,
}

impl HealthCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail-closed: false until a probe has ever succeeded, false again
    /// when the last success has aged out.
    pub fn is_healthy(&self) -> bool {
        let state = self.state.read().expect("health lock");
        state.healthy
            && state
                .last_success
                .map(|at| at.elapsed() < RECENCY_WINDOW)
                .unwrap_or(false)
    }

    pub fn status(&self) -> Option<SystemStatus> {
        self.state.read().expect("health lock").status.clone()
    }

    pub fn record_success(&self, status: SystemStatus) {
        let mut state = self.state.write().expect("health lock");
        state.healthy = status.healthy;
        state.status = Some(status);
        state.last_success = Some(Instant::now());
    }

    pub fn record_failure(&self) {
        let mut state = self.state.write().expect("health lock");
        state.healthy = false;
    }
}

/// Run the prober until shutdown.
pub async fn run<S, F>(
    agent: Arc<dyn Agent>,
    cache: Arc<HealthCache>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!(interval = ?PROBE_INTERVAL, "Health prober starting...");

    // Immediate check on startup, then the steady cadence.
    probe(&agent, &cache).await;

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Health prober shutting down...");
                return;
            }
            _ = sleep_fn(PROBE_INTERVAL) => {
                probe(&agent, &cache).await;
            }
        }
    }
}

async fn probe(agent: &Arc<dyn Agent>, cache: &Arc<HealthCache>) {
    match tokio::time::timeout(PROBE_TIMEOUT, agent.get_system_status()).await {
        Ok(Ok(status)) => {
            debug!(
                cpu = status.cpu_usage_percent,
                memory_mb = status.memory_usage_mb,
                jails = status.active_jails,
                "muscle heartbeat received"
            );
            cache.record_success(status);
        }
        Ok(Err(e)) => {
            error!(error = %e, "muscle health probe failed");
            cache.record_failure();
        }
        Err(_) => {
            error!(timeout = ?PROBE_TIMEOUT, "muscle health probe timed out");
            cache.record_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::inmemory::InMemoryAgent;

    #[tokio::test]
    async fn unhealthy_until_first_successful_probe() {
        let cache = Arc::new(HealthCache::new());
        assert!(!cache.is_healthy());

        let agent: Arc<dyn Agent> = Arc::new(InMemoryAgent::new());
        probe(&agent, &cache).await;
        assert!(cache.is_healthy());
        assert!(cache.status().is_some());
    }

    #[tokio::test]
    async fn failure_flips_the_cache_unhealthy() {
        let cache = Arc::new(HealthCache::new());
        let agent: Arc<dyn Agent> = Arc::new(InMemoryAgent::new());
        probe(&agent, &cache).await;
        assert!(cache.is_healthy());

        cache.record_failure();
        assert!(!cache.is_healthy());
    }
}
