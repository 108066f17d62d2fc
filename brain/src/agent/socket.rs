//! Framed-JSON agent client over the local socket
//!
//! One connection per call. Unary calls carry a 60 s deadline; the
//! deployment stream has none and is ended by EOF, an error frame, or
//! cancellation (which simply closes the connection — the agent reacts by
//! killing the build).

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use kari_proto::{
    read_frame, write_frame, AgentRequest, AgentResponse, RequestEnvelope, SiteActivationAction,
    StreamFrame, SystemCheckReport, SystemStatus,
};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::domain::{CertificateMaterial, Deployment, Site};
use crate::errors::PanelError;
use crate::ports::{Agent, DeploymentStream, StreamCancel};

const UNARY_DEADLINE: Duration = Duration::from_secs(60);

/// Buffer between the socket reader task and the deployment worker.
const STREAM_BUFFER: usize = 256;

pub struct SocketAgent {
    socket_path: PathBuf,
}

impl SocketAgent {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    async fn connect(&self) -> Result<UnixStream, PanelError> {
        UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| PanelError::Transient(format!("agent socket unavailable: {e}")))
    }

    /// One request, one response, bounded by the unary deadline. The
    /// serialized frame is scrubbed after the write because install
    /// requests carry key material.
    async fn call_unary(&self, request: AgentRequest) -> Result<AgentResponse, PanelError> {
        let fut = async {
            let mut stream = self.connect().await?;

            let mut frame = serde_json::to_vec(&RequestEnvelope::new(request))
                .map_err(|e| PanelError::Internal(format!("encode request: {e}")))?;
            let write_result = write_frame(&mut stream, &frame).await;
            frame.zeroize();
            write_result.map_err(|e| PanelError::Transient(format!("agent write: {e}")))?;

            let response = read_frame(&mut stream)
                .await
                .map_err(|e| PanelError::Transient(format!("agent read: {e}")))?
                .ok_or_else(|| {
                    PanelError::Unauthorized(
                        "agent closed the connection before responding".to_string(),
                    )
                })?;

            serde_json::from_slice::<AgentResponse>(&response)
                .map_err(|e| PanelError::Internal(format!("decode response: {e}")))
        };

        let response = tokio::time::timeout(UNARY_DEADLINE, fut)
            .await
            .map_err(|_| PanelError::Transient("agent rpc deadline exceeded".to_string()))??;

        match response {
            AgentResponse::Error { error } => Err(error.into()),
            other => Ok(other),
        }
    }

    async fn expect_ack(&self, request: AgentRequest) -> Result<(), PanelError> {
        match self.call_unary(request).await? {
            AgentResponse::Ack {} | AgentResponse::SiteActivated { ok: true } => Ok(()),
            AgentResponse::SiteActivated { ok: false } => Err(PanelError::Internal(
                "agent reported unsuccessful activation step".to_string(),
            )),
            other => Err(PanelError::Internal(format!(
                "unexpected agent response: {other:?}"
            ))),
        }
    }

    async fn activate(&self, site: &Site, action: SiteActivationAction) -> Result<(), PanelError> {
        self.expect_ack(AgentRequest::ActivateSite {
            site_id: site.id.clone(),
            domain: site.domain.clone(),
            ipv4: site.ipv4.clone(),
            ipv6: site.ipv6.clone(),
            owner_uid: site.owner_uid,
            action,
        })
        .await
    }
}

#[async_trait]
impl Agent for SocketAgent {
    async fn create_system_user(&self, site: &Site) -> Result<(), PanelError> {
        self.activate(site, SiteActivationAction::CreateSystemUser).await
    }

    async fn apply_http_vhost(&self, site: &Site) -> Result<(), PanelError> {
        self.activate(site, SiteActivationAction::ApplyHttpVhost).await
    }

    async fn issue_certificate(&self, site: &Site) -> Result<(), PanelError> {
        self.activate(site, SiteActivationAction::IssueCertificate).await
    }

    async fn apply_https_vhost(&self, site: &Site) -> Result<(), PanelError> {
        self.activate(site, SiteActivationAction::ApplyHttpsVhost).await
    }

    async fn run_system_check(&self, server_id: &str) -> Result<SystemCheckReport, PanelError> {
        match self
            .call_unary(AgentRequest::RunSystemCheck {
                server_id: server_id.to_string(),
            })
            .await?
        {
            AgentResponse::SystemCheck { report } => Ok(report),
            other => Err(PanelError::Internal(format!(
                "unexpected agent response: {other:?}"
            ))),
        }
    }

    async fn present_challenge(
        &self,
        domain: &str,
        token: &str,
        key_auth: &str,
    ) -> Result<(), PanelError> {
        self.expect_ack(AgentRequest::PresentChallenge {
            domain: domain.to_string(),
            token: token.to_string(),
            key_auth: key_auth.to_string(),
        })
        .await
    }

    async fn cleanup_challenge(&self, domain: &str, token: &str) -> Result<(), PanelError> {
        self.expect_ack(AgentRequest::CleanupChallenge {
            domain: domain.to_string(),
            token: token.to_string(),
        })
        .await
    }

    async fn install_certificate(&self, material: CertificateMaterial) -> Result<(), PanelError> {
        let CertificateMaterial {
            domain,
            fullchain_pem,
            mut privkey_pem,
            expires_at: _,
        } = material;

        let result = self
            .expect_ack(AgentRequest::InstallCertificate {
                domain,
                fullchain_pem,
                privkey_pem: privkey_pem.clone(),
            })
            .await;

        // Best-effort zeroization of our copy before the buffer returns
        // to the allocator. The agent scrubbed its own copy already.
        privkey_pem.zeroize();
        result
    }

    async fn get_system_status(&self) -> Result<SystemStatus, PanelError> {
        match self.call_unary(AgentRequest::GetSystemStatus {}).await? {
            AgentResponse::Status { status } => Ok(status),
            other => Err(PanelError::Internal(format!(
                "unexpected agent response: {other:?}"
            ))),
        }
    }

    async fn stream_deployment(
        &self,
        deployment: &Deployment,
    ) -> Result<DeploymentStream, PanelError> {
        let mut stream = self.connect().await?;

        let envelope = RequestEnvelope::new(AgentRequest::StreamDeployment {
            trace_id: deployment.id.clone(),
            app_id: deployment.app_id.clone(),
            domain: deployment.domain.clone(),
            repo_url: deployment.repo_url.clone(),
            branch: deployment.branch.clone(),
            build_command: deployment.build_command.clone(),
            port: deployment.port,
            ssh_key: deployment.ssh_key.clone(),
        });
        let mut frame = serde_json::to_vec(&envelope)
            .map_err(|e| PanelError::Internal(format!("encode request: {e}")))?;
        let write_result = write_frame(&mut stream, &frame).await;

        // The frame and the envelope may carry the deploy key; scrub
        // both copies before looking at the write's outcome.
        frame.zeroize();
        if let AgentRequest::StreamDeployment {
            ssh_key: Some(mut key),
            ..
        } = envelope.request
        {
            key.zeroize();
        }
        write_result.map_err(|e| PanelError::Transient(format!("agent write: {e}")))?;

        let (chunk_tx, chunk_rx) = mpsc::channel(STREAM_BUFFER);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (cancel, mut cancel_rx) = StreamCancel::new();
        let trace_id = deployment.id.clone();

        tokio::spawn(async move {
            let mut saw_eof = false;
            let outcome = loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        // Dropping the stream closes the connection; the
                        // agent kills the build in response.
                        debug!(trace_id, "deployment stream cancelled");
                        break Err(PanelError::Transient("stream cancelled".to_string()));
                    }
                    frame = read_frame(&mut stream) => {
                        match frame {
                            Ok(Some(bytes)) => {
                                match serde_json::from_slice::<StreamFrame>(&bytes) {
                                    Ok(StreamFrame::Chunk { chunk }) => {
                                        let is_eof = chunk.is_eof;
                                        if chunk_tx.send(chunk).await.is_err() {
                                            break Err(PanelError::Transient(
                                                "stream consumer went away".to_string(),
                                            ));
                                        }
                                        if is_eof {
                                            saw_eof = true;
                                        }
                                    }
                                    Ok(StreamFrame::Error { error }) => {
                                        break Err(error.into());
                                    }
                                    Err(e) => {
                                        warn!(trace_id, error = %e, "malformed stream frame");
                                        break Err(PanelError::Internal(
                                            "malformed stream frame".to_string(),
                                        ));
                                    }
                                }
                            }
                            Ok(None) => {
                                break if saw_eof {
                                    Ok(())
                                } else {
                                    Err(PanelError::Transient("stream broken".to_string()))
                                };
                            }
                            Err(e) => {
                                break Err(PanelError::Transient(format!("stream read: {e}")));
                            }
                        }
                    }
                }
            };
            let _ = outcome_tx.send(outcome);
        });

        Ok(DeploymentStream {
            chunks: chunk_rx,
            outcome: outcome_rx,
            cancel,
        })
    }
}
