//! Deployment worker
//!
//! Polls the queue, claims the oldest pending deployment (single-winner),
//! opens the agent's log stream, and pipes every chunk into both the
//! repository log and the fan-out hub. The hub receives the stream's
//! cancel handle so a ghost stream dies with its last subscriber.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use kari_proto::LogChunk;
use tracing::{error, info};

use crate::alerts::Alert;
use crate::domain::{Deployment, DeploymentStatus};
use crate::errors::PanelError;
use crate::hub::LogHub;
use crate::ports::{Agent, AlertSink, DeploymentRepository};

/// Deployment worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Queue polling interval
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

/// Run the deployment worker until shutdown.
pub async fn run<S, F>(
    options: &Options,
    repo: Arc<dyn DeploymentRepository>,
    agent: Arc<dyn Agent>,
    hub: Arc<LogHub>,
    alerts: Arc<dyn AlertSink>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Deployment worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Deployment worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        loop {
            let claimed = match repo.claim_next_pending().await {
                Ok(Some(deployment)) => deployment,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "failed to poll deployment queue");
                    break;
                }
            };

            process_deployment(claimed, &repo, &agent, &hub, &alerts).await;
        }
    }
}

/// Drive one claimed deployment to a terminal status.
pub async fn process_deployment(
    mut deployment: Deployment,
    repo: &Arc<dyn DeploymentRepository>,
    agent: &Arc<dyn Agent>,
    hub: &Arc<LogHub>,
    alerts: &Arc<dyn AlertSink>,
) {
    info!(
        deployment_id = deployment.id,
        domain = deployment.domain,
        "starting deployment"
    );

    let stream_result = agent.stream_deployment(&deployment).await;

    // The agent owns the deploy key now (or the call failed and it is
    // not needed); either way the worker's copy goes away.
    deployment.scrub_ssh_key();

    let stream = match stream_result {
        Ok(stream) => stream,
        Err(e) => {
            finish_failed(&deployment, &e, repo, hub, alerts).await;
            return;
        }
    };

    let mut chunks = stream.chunks;
    hub.register_cancel(&deployment.id, stream.cancel);

    // Chunks flow to subscribers and the persistent log in emission
    // order. The EOF chunk passes through before the channels close.
    while let Some(chunk) = chunks.recv().await {
        let _ = repo.append_log(&deployment.id, &chunk.message).await;
        hub.broadcast(&deployment.id, &chunk);
    }

    let outcome = match stream.outcome.await {
        Ok(outcome) => outcome,
        Err(_) => Err(PanelError::Internal(
            "deployment stream dropped without an outcome".to_string(),
        )),
    };

    match outcome {
        Ok(()) => {
            let _ = repo
                .update_status(&deployment.id, DeploymentStatus::Success)
                .await;
            hub.finish(&deployment.id);
            info!(deployment_id = deployment.id, "deployment succeeded");
        }
        Err(e) => finish_failed(&deployment, &e, repo, hub, alerts).await,
    }
}

/// Terminal failure: tagged line into the log and the terminals, EOF to
/// the subscribers, status flip, critical alert.
async fn finish_failed(
    deployment: &Deployment,
    err: &PanelError,
    repo: &Arc<dyn DeploymentRepository>,
    hub: &Arc<LogHub>,
    alerts: &Arc<dyn AlertSink>,
) {
    error!(deployment_id = deployment.id, error = %err, "deployment failed");

    let line = format!("{} {}\n", err.kind().tag(), err.operator_message());
    let _ = repo.append_log(&deployment.id, &line).await;
    hub.broadcast(
        &deployment.id,
        &LogChunk::system(&deployment.id, line.clone()),
    );
    hub.broadcast(&deployment.id, &LogChunk::eof(&deployment.id));
    hub.finish(&deployment.id);

    let _ = repo
        .update_status(&deployment.id, DeploymentStatus::Failed)
        .await;

    alerts
        .record(Alert::critical(
            "deployment",
            &deployment.id,
            err.kind(),
            err.operator_message(),
        ))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::inmemory::InMemoryAgent;
    use crate::repo::memory::{InMemoryDeploymentRepository, MemoryAlertSink};

    fn deployment() -> Deployment {
        Deployment::new(
            "site-1",
            "site-1",
            "example.com",
            "https://example.com/repo.git",
            "main",
            "true",
            3000,
        )
    }

    #[tokio::test]
    async fn successful_stream_marks_success_and_closes_subscribers() {
        let repo: Arc<dyn DeploymentRepository> = Arc::new(InMemoryDeploymentRepository::new());
        let agent: Arc<dyn Agent> = Arc::new(InMemoryAgent::new());
        let hub = Arc::new(LogHub::new());
        let alerts_impl = Arc::new(MemoryAlertSink::new());
        let alerts: Arc<dyn AlertSink> = alerts_impl.clone();

        let d = deployment();
        let id = d.id.clone();
        repo.enqueue(d).await.unwrap();
        let claimed = repo.claim_next_pending().await.unwrap().unwrap();

        let (_sub, mut rx) = hub.subscribe(&id);

        process_deployment(claimed, &repo, &agent, &hub, &alerts).await;

        // Subscriber saw the chunks in order, then EOF, then closure.
        let mut messages = Vec::new();
        let mut saw_eof = false;
        while let Some(chunk) = rx.recv().await {
            if chunk.is_eof {
                saw_eof = true;
            } else {
                messages.push(chunk.message);
            }
        }
        assert!(saw_eof);
        assert_eq!(messages.len(), 3);

        let logs = repo.logs(&id).await.unwrap();
        assert!(logs.iter().any(|l| l.contains("Build successful")));
        assert!(alerts_impl.all().is_empty());
    }

    #[tokio::test]
    async fn agent_connection_failure_marks_failed_with_alert() {
        struct DeadAgent;

        #[async_trait::async_trait]
        impl Agent for DeadAgent {
            async fn create_system_user(&self, _: &crate::domain::Site) -> Result<(), PanelError> {
                unreachable!()
            }
            async fn apply_http_vhost(&self, _: &crate::domain::Site) -> Result<(), PanelError> {
                unreachable!()
            }
            async fn issue_certificate(&self, _: &crate::domain::Site) -> Result<(), PanelError> {
                unreachable!()
            }
            async fn apply_https_vhost(&self, _: &crate::domain::Site) -> Result<(), PanelError> {
                unreachable!()
            }
            async fn run_system_check(
                &self,
                _: &str,
            ) -> Result<kari_proto::SystemCheckReport, PanelError> {
                unreachable!()
            }
            async fn present_challenge(
                &self,
                _: &str,
                _: &str,
                _: &str,
            ) -> Result<(), PanelError> {
                unreachable!()
            }
            async fn cleanup_challenge(&self, _: &str, _: &str) -> Result<(), PanelError> {
                unreachable!()
            }
            async fn install_certificate(
                &self,
                _: crate::domain::CertificateMaterial,
            ) -> Result<(), PanelError> {
                unreachable!()
            }
            async fn get_system_status(&self) -> Result<kari_proto::SystemStatus, PanelError> {
                unreachable!()
            }
            async fn stream_deployment(
                &self,
                _: &Deployment,
            ) -> Result<crate::ports::DeploymentStream, PanelError> {
                Err(PanelError::Transient("agent socket unavailable".to_string()))
            }
        }

        let repo: Arc<dyn DeploymentRepository> = Arc::new(InMemoryDeploymentRepository::new());
        let agent: Arc<dyn Agent> = Arc::new(DeadAgent);
        let hub = Arc::new(LogHub::new());
        let alerts_impl = Arc::new(MemoryAlertSink::new());
        let alerts: Arc<dyn AlertSink> = alerts_impl.clone();

        let d = deployment();
        let id = d.id.clone();
        repo.enqueue(d).await.unwrap();
        let claimed = repo.claim_next_pending().await.unwrap().unwrap();

        process_deployment(claimed, &repo, &agent, &hub, &alerts).await;

        let logs = repo.logs(&id).await.unwrap();
        assert!(logs.iter().any(|l| l.starts_with("[TRANSIENT]")));
        assert_eq!(alerts_impl.all().len(), 1);
    }
}
