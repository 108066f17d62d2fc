//! In-process fake agent
//!
//! Canned-success agent for dev mode and tests. Records every intent it
//! receives in order, which is what the pipeline tests assert against.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kari_proto::{LogChunk, SystemCheckReport, SystemStatus};
use tokio::sync::{mpsc, oneshot};

use crate::domain::{CertificateMaterial, Deployment, Site};
use crate::errors::PanelError;
use crate::ports::{Agent, DeploymentStream, StreamCancel};

#[derive(Default)]
pub struct InMemoryAgent {
    calls: Mutex<Vec<String>>,
}

impl InMemoryAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intent names in the order they arrived.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().expect("calls lock").push(call.into());
    }
}

#[async_trait]
impl Agent for InMemoryAgent {
    async fn create_system_user(&self, _site: &Site) -> Result<(), PanelError> {
        self.record("create_system_user");
        Ok(())
    }

    async fn apply_http_vhost(&self, _site: &Site) -> Result<(), PanelError> {
        self.record("apply_http_vhost");
        Ok(())
    }

    async fn issue_certificate(&self, _site: &Site) -> Result<(), PanelError> {
        self.record("issue_certificate");
        Ok(())
    }

    async fn apply_https_vhost(&self, _site: &Site) -> Result<(), PanelError> {
        self.record("apply_https_vhost");
        Ok(())
    }

    async fn run_system_check(&self, server_id: &str) -> Result<SystemCheckReport, PanelError> {
        self.record(format!("run_system_check:{server_id}"));
        Ok(SystemCheckReport {
            distro: "ubuntu".to_string(),
            version: "22.04".to_string(),
            services: BTreeMap::from([
                ("nginx".to_string(), "active".to_string()),
                ("postgresql".to_string(), "active".to_string()),
            ]),
            firewall_type: "ufw".to_string(),
            firewall_status: "active".to_string(),
        })
    }

    async fn present_challenge(
        &self,
        _domain: &str,
        token: &str,
        _key_auth: &str,
    ) -> Result<(), PanelError> {
        self.record(format!("present_challenge:{token}"));
        Ok(())
    }

    async fn cleanup_challenge(&self, _domain: &str, token: &str) -> Result<(), PanelError> {
        self.record(format!("cleanup_challenge:{token}"));
        Ok(())
    }

    async fn install_certificate(&self, material: CertificateMaterial) -> Result<(), PanelError> {
        self.record(format!("install_certificate:{}", material.domain));
        Ok(())
    }

    async fn get_system_status(&self) -> Result<SystemStatus, PanelError> {
        Ok(SystemStatus {
            healthy: true,
            distro: "ubuntu".to_string(),
            cpu_usage_percent: 1.0,
            memory_usage_mb: 32,
            active_jails: 0,
        })
    }

    async fn stream_deployment(
        &self,
        deployment: &Deployment,
    ) -> Result<DeploymentStream, PanelError> {
        self.record(format!("stream_deployment:{}", deployment.id));

        let (chunk_tx, chunk_rx) = mpsc::channel(16);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (cancel, mut cancel_rx) = StreamCancel::new();
        let trace_id = deployment.id.clone();

        tokio::spawn(async move {
            let lines = [
                "Cloning repository...\n",
                "Build successful.\n",
                "Deployment complete.\n",
            ];
            for line in lines {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        let _ = outcome_tx
                            .send(Err(PanelError::Transient("stream cancelled".to_string())));
                        return;
                    }
                    sent = chunk_tx.send(LogChunk::system(&trace_id, line)) => {
                        if sent.is_err() {
                            let _ = outcome_tx.send(Err(PanelError::Transient(
                                "stream consumer went away".to_string(),
                            )));
                            return;
                        }
                    }
                }
            }
            let _ = chunk_tx.send(LogChunk::eof(&trace_id)).await;
            let _ = outcome_tx.send(Ok(()));
        });

        Ok(DeploymentStream {
            chunks: chunk_rx,
            outcome: outcome_rx,
            cancel,
        })
    }
}
