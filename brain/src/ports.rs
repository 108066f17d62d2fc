//! Trait seams for the brain's external collaborators
//!
//! The pipeline, workers, and HTTP handlers are written against these
//! traits. Production wires the socket agent, the ACME authority, and the
//! in-memory repositories; tests substitute recording fakes.

use async_trait::async_trait;
use kari_proto::{LogChunk, SystemCheckReport, SystemStatus};
use tokio::sync::{mpsc, oneshot};

use crate::alerts::Alert;
use crate::domain::{CertificateMaterial, Deployment, DeploymentStatus, Site, SiteRecord};
use crate::errors::PanelError;

/// Handle that cancels an in-flight deployment stream. Firing it closes
/// the client side of the stream, which the agent observes and answers by
/// terminating the build.
pub struct StreamCancel(oneshot::Sender<()>);

impl StreamCancel {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub fn fire(self) {
        let _ = self.0.send(());
    }
}

/// A live deployment stream as handed to the deployment worker.
pub struct DeploymentStream {
    /// Log chunks in agent emission order, ending with an EOF chunk on
    /// success.
    pub chunks: mpsc::Receiver<LogChunk>,
    /// Resolves once the stream ends: Ok for a completed deployment,
    /// the classified error otherwise.
    pub outcome: oneshot::Receiver<Result<(), PanelError>>,
    /// Cancels the upstream stream (ghost-stream mitigation).
    pub cancel: StreamCancel,
}

/// The agent contract: every way the brain may mutate the host.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn create_system_user(&self, site: &Site) -> Result<(), PanelError>;
    async fn apply_http_vhost(&self, site: &Site) -> Result<(), PanelError>;
    /// Confirmation intent sent after certificate material is installed.
    async fn issue_certificate(&self, site: &Site) -> Result<(), PanelError>;
    async fn apply_https_vhost(&self, site: &Site) -> Result<(), PanelError>;

    async fn run_system_check(&self, server_id: &str) -> Result<SystemCheckReport, PanelError>;

    async fn present_challenge(
        &self,
        domain: &str,
        token: &str,
        key_auth: &str,
    ) -> Result<(), PanelError>;
    async fn cleanup_challenge(&self, domain: &str, token: &str) -> Result<(), PanelError>;

    /// Hands PEM material to the agent. The implementation zeroizes its
    /// private-key copy before returning.
    async fn install_certificate(&self, material: CertificateMaterial) -> Result<(), PanelError>;

    async fn get_system_status(&self) -> Result<SystemStatus, PanelError>;

    async fn stream_deployment(
        &self,
        deployment: &Deployment,
    ) -> Result<DeploymentStream, PanelError>;
}

/// Pluggable DNS: publishes A/AAAA records ahead of ACME validation.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn ensure_address_records(&self, site: &Site) -> Result<(), PanelError>;
}

/// Obtains certificates, typically by driving the agent's HTTP-01
/// challenge RPCs against an ACME directory.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    async fn issue(&self, domain: &str) -> Result<CertificateMaterial, PanelError>;
}

/// Site persistence. A site becomes `active` only after every activation
/// step succeeded.
#[async_trait]
pub trait SiteRepository: Send + Sync {
    async fn save(&self, site: Site) -> Result<(), PanelError>;
    async fn get(&self, site_id: &str) -> Result<Option<SiteRecord>, PanelError>;
    async fn mark_active(
        &self,
        site_id: &str,
        cert_expires_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(), PanelError>;
    async fn list_active(&self) -> Result<Vec<SiteRecord>, PanelError>;
}

/// Deployment queue and log persistence.
#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    async fn enqueue(&self, deployment: Deployment) -> Result<(), PanelError>;

    async fn get(&self, deployment_id: &str) -> Result<Option<Deployment>, PanelError>;

    /// Atomically select the oldest pending deployment and mark it
    /// running. Single-winner: two concurrent claimers never receive the
    /// same deployment. The claimed copy carries the deploy key; the
    /// stored record is scrubbed of it at claim time.
    async fn claim_next_pending(&self) -> Result<Option<Deployment>, PanelError>;

    async fn update_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
    ) -> Result<(), PanelError>;

    async fn append_log(&self, deployment_id: &str, line: &str) -> Result<(), PanelError>;
    async fn logs(&self, deployment_id: &str) -> Result<Vec<String>, PanelError>;
}

/// Receives classified system alerts; the Action Center UI consumes them.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn record(&self, alert: Alert);
}
