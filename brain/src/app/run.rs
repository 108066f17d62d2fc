//! Main application run loop
//!
//! Wires the dependency graph by configuration (real socket agent vs the
//! in-process fake, ACME vs canned certificates), starts the background
//! workers, and serves HTTP until the shutdown signal fires.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::acme::{AcmeCertificateAuthority, InMemoryCertificateAuthority};
use crate::agent::inmemory::InMemoryAgent;
use crate::agent::socket::SocketAgent;
use crate::api::handlers::ApiContext;
use crate::api::serve::serve;
use crate::config::{AgentTransport, BrainConfig};
use crate::dns::InMemoryDnsProvider;
use crate::errors::PanelError;
use crate::hub::LogHub;
use crate::pipeline::activation::ActivationPipeline;
use crate::pipeline::deployments::DeploymentService;
use crate::pipeline::onboarding::OnboardingService;
use crate::ports::{Agent, AlertSink, CertificateAuthority, DeploymentRepository, SiteRepository};
use crate::repo::memory::{
    InMemoryDeploymentRepository, InMemorySiteRepository, MemoryAlertSink,
};
use crate::workers::{deployment, health, ssl_renewer};

const MAX_SHUTDOWN_DELAY: Duration = Duration::from_secs(10);

/// Run the Kari brain
pub async fn run(
    config: BrainConfig,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), PanelError> {
    info!("Initializing Kari Brain...");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let agent: Arc<dyn Agent> = match config.agent_transport {
        AgentTransport::Socket => {
            info!(socket = config.agent_address, "using socket agent transport");
            Arc::new(SocketAgent::new(&config.agent_address))
        }
        AgentTransport::InMemory => {
            info!("using in-memory agent transport");
            Arc::new(InMemoryAgent::new())
        }
    };

    let ca: Arc<dyn CertificateAuthority> = if config.acme_directory_url.is_empty() {
        Arc::new(InMemoryCertificateAuthority::new())
    } else {
        Arc::new(AcmeCertificateAuthority::new(
            config.acme_directory_url.clone(),
            config.acme_contact_email.clone(),
            agent.clone(),
        ))
    };

    let dns = Arc::new(InMemoryDnsProvider::new());
    let sites: Arc<dyn SiteRepository> = Arc::new(InMemorySiteRepository::new());
    let deployments: Arc<dyn DeploymentRepository> = Arc::new(InMemoryDeploymentRepository::new());
    let alerts: Arc<dyn AlertSink> = Arc::new(MemoryAlertSink::new());
    let hub = Arc::new(LogHub::new());
    let health_cache = Arc::new(health::HealthCache::new());

    let context = Arc::new(ApiContext {
        activation: ActivationPipeline::new(
            agent.clone(),
            dns,
            ca.clone(),
            sites.clone(),
            alerts.clone(),
        ),
        onboarding: OnboardingService::new(agent.clone()),
        deployments: DeploymentService::new(sites.clone(), deployments.clone()),
        hub: hub.clone(),
        health: health_cache.clone(),
    });

    // Background workers, each tied to the shutdown broadcast.
    let mut worker_handles: Vec<(&str, JoinHandle<()>)> = Vec::new();

    worker_handles.push((
        "health-prober",
        tokio::spawn(worker_shutdown(shutdown_tx.subscribe(), {
            let agent = agent.clone();
            let cache = health_cache.clone();
            move |signal| health::run(agent, cache, tokio::time::sleep, signal)
        })),
    ));

    worker_handles.push((
        "deployment-worker",
        tokio::spawn(worker_shutdown(shutdown_tx.subscribe(), {
            let repo = deployments.clone();
            let agent = agent.clone();
            let hub = hub.clone();
            let alerts = alerts.clone();
            move |signal| async move {
                deployment::run(
                    &deployment::Options::default(),
                    repo,
                    agent,
                    hub,
                    alerts,
                    tokio::time::sleep,
                    signal,
                )
                .await
            }
        })),
    ));

    worker_handles.push((
        "ssl-renewer",
        tokio::spawn(worker_shutdown(shutdown_tx.subscribe(), {
            let sites = sites.clone();
            let ca = ca.clone();
            let agent = agent.clone();
            let alerts = alerts.clone();
            move |signal| async move {
                ssl_renewer::run(
                    &ssl_renewer::Options::default(),
                    sites,
                    ca,
                    agent,
                    alerts,
                    tokio::time::sleep,
                    signal,
                )
                .await
            }
        })),
    ));

    // HTTP edge.
    let mut http_shutdown = shutdown_tx.subscribe();
    let server_handle = serve(&config.bind_address(), context, async move {
        let _ = http_shutdown.recv().await;
    })
    .await?;

    // Run until asked to stop.
    shutdown_signal.await;
    info!("Shutting down Kari Brain...");
    let _ = shutdown_tx.send(());

    let shutdown = async {
        for (name, handle) in worker_handles {
            if let Err(e) = handle.await {
                error!(worker = name, error = %e, "worker task failed during shutdown");
            }
        }
        match server_handle.await {
            Ok(result) => result,
            Err(e) => Err(PanelError::Internal(format!("http server task: {e}"))),
        }
    };

    match tokio::time::timeout(MAX_SHUTDOWN_DELAY, shutdown).await {
        Ok(result) => {
            info!("Shutdown complete");
            result
        }
        Err(_) => {
            error!("Shutdown timed out after {MAX_SHUTDOWN_DELAY:?}, forcing exit");
            std::process::exit(1);
        }
    }
}

/// Adapt a broadcast receiver into the pinned future the workers take as
/// their shutdown signal.
async fn worker_shutdown<F, Fut>(mut rx: broadcast::Receiver<()>, worker: F)
where
    F: FnOnce(std::pin::Pin<Box<dyn Future<Output = ()> + Send>>) -> Fut,
    Fut: Future<Output = ()>,
{
    let signal = Box::pin(async move {
        let _ = rx.recv().await;
    });
    worker(signal).await;
}
