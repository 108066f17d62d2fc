//! Typed request dispatch
//!
//! Handlers translate wire requests into host-layer calls and classify
//! every failure before it crosses the socket. The raw error (OS detail
//! included) is logged here, inside the agent process, and nowhere else.

use kari_proto::{AgentRequest, AgentResponse, LogChunk, SiteActivationAction, SystemStatus};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::AgentConfig;
use crate::deploy::stream::{DeployEngine, DeploymentSpec};
use crate::errors::AgentError;
use crate::host::certs::CertificateStore;
use crate::host::challenge::ChallengeManager;
use crate::host::check::SystemChecker;
use crate::host::jail::JailManager;
use crate::host::proxy::ProxyManager;
use crate::host::units::ServiceManager;
use crate::secrets::SecretBytes;
use crate::telemetry;

/// Loopback port activation-time vhosts proxy to; the deployment's unit
/// exports the same port to the app.
pub const DEFAULT_APP_PORT: u16 = 3000;

/// Capacity of the channel between the deploy engine and the socket
/// writer. The writer is local and fast; this bound only matters when the
/// brain stops reading.
const STREAM_CHANNEL_CAPACITY: usize = 512;

pub struct AgentHandlers {
    config: AgentConfig,
    jail: JailManager,
    certs: CertificateStore,
    challenge: ChallengeManager,
    proxy: ProxyManager,
    checker: SystemChecker,
    engine: DeployEngine,
}

impl AgentHandlers {
    pub fn new(config: AgentConfig) -> Self {
        let jail = JailManager::new(config.app_root.clone());
        let services = ServiceManager::new(config.services_root.clone());
        let engine = DeployEngine::new(
            jail.clone(),
            services,
            config.app_root.clone(),
            config.releases_per_app_keep,
        );

        Self {
            jail,
            certs: CertificateStore::new(config.cert_root.clone()),
            challenge: ChallengeManager::new(
                config.web_root.clone(),
                config.web_user.clone(),
                config.web_group.clone(),
            ),
            proxy: ProxyManager::new(config.sites_root.clone()),
            checker: SystemChecker::new(),
            engine,
            config,
        }
    }

    /// Handle one unary request. Streaming requests never come here.
    pub async fn handle_unary(&self, request: AgentRequest) -> AgentResponse {
        let result = self.dispatch_unary(request).await;
        match result {
            Ok(response) => response,
            Err(e) => {
                // Raw detail stays in this log line; the wire only sees
                // the classified form.
                error!(code = e.code().as_str(), error = %e, "rpc handler failed");
                AgentResponse::Error { error: e.to_wire() }
            }
        }
    }

    async fn dispatch_unary(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        match request {
            AgentRequest::RunSystemCheck { server_id } => {
                let report = self.checker.run(&server_id).await?;
                Ok(AgentResponse::SystemCheck { report })
            }

            AgentRequest::ActivateSite {
                site_id,
                domain,
                ipv4: _,
                ipv6: _,
                owner_uid,
                action,
            } => {
                self.activate_site(&site_id, &domain, owner_uid, action)
                    .await?;
                Ok(AgentResponse::SiteActivated { ok: true })
            }

            AgentRequest::PresentChallenge {
                domain,
                token,
                key_auth,
            } => {
                self.challenge.present(&domain, &token, &key_auth).await?;
                Ok(AgentResponse::Ack {})
            }

            AgentRequest::CleanupChallenge { domain, token } => {
                self.challenge.cleanup(&domain, &token).await?;
                Ok(AgentResponse::Ack {})
            }

            AgentRequest::InstallCertificate {
                domain,
                fullchain_pem,
                privkey_pem,
            } => {
                // Wrap the key bytes immediately; from here on the only
                // plaintext copy lives inside the zeroizing wrapper.
                let privkey = SecretBytes::new(privkey_pem);
                self.certs.install(&domain, &fullchain_pem, privkey).await?;
                Ok(AgentResponse::Ack {})
            }

            AgentRequest::GetSystemStatus {} => {
                let status = self.system_status().await;
                Ok(AgentResponse::Status { status })
            }

            AgentRequest::StreamDeployment { .. } => Err(AgentError::Rejected(
                "stream_deployment is not a unary request".to_string(),
            )),
        }
    }

    async fn activate_site(
        &self,
        site_id: &str,
        domain: &str,
        owner_uid: u32,
        action: SiteActivationAction,
    ) -> Result<(), AgentError> {
        if site_id.trim().is_empty() {
            return Err(AgentError::Rejected("site id is required".to_string()));
        }
        if domain.trim().is_empty() {
            return Err(AgentError::Rejected("domain is required".to_string()));
        }
        if owner_uid == 0 {
            return Err(AgentError::Rejected(
                "owner uid must be positive".to_string(),
            ));
        }

        match action {
            SiteActivationAction::CreateSystemUser => {
                self.jail.provision_user(site_id, owner_uid).await?;
                let home = self.jail.home_for(site_id);
                self.jail.secure_dir(&home, owner_uid).await?;
            }

            SiteActivationAction::ApplyHttpVhost => {
                let conf = ProxyManager::render_http_vhost(
                    domain,
                    DEFAULT_APP_PORT,
                    &self.config.web_root.to_string_lossy(),
                );
                self.proxy.apply_vhost(domain, &conf).await?;
            }

            SiteActivationAction::IssueCertificate => {
                self.require_certificate(domain)?;
            }

            SiteActivationAction::ApplyHttpsVhost => {
                self.require_certificate(domain)?;
                let conf = ProxyManager::render_https_vhost(
                    domain,
                    DEFAULT_APP_PORT,
                    &self.config.web_root.to_string_lossy(),
                    &self.certs.fullchain_path(domain).to_string_lossy(),
                    &self.certs.privkey_path(domain).to_string_lossy(),
                );
                self.proxy.apply_vhost(domain, &conf).await?;
            }
        }

        info!(site_id, domain, ?action, "site activation step complete");
        Ok(())
    }

    /// The HTTPS steps require installed material; a missing chain means
    /// the brain skipped `InstallCertificate` and must not proceed.
    fn require_certificate(&self, domain: &str) -> Result<(), AgentError> {
        let fullchain = self.certs.fullchain_path(domain);
        let privkey = self.certs.privkey_path(domain);
        if !fullchain.is_file() || !privkey.is_file() {
            return Err(AgentError::Precondition(format!(
                "no installed certificate for {domain}"
            )));
        }
        Ok(())
    }

    async fn system_status(&self) -> SystemStatus {
        let jails = self.jail.jail_count().await;
        telemetry::collect_status(jails)
    }

    /// Start a streaming deployment; chunks arrive on the returned
    /// receiver, ending with an EOF chunk on success. The engine task is
    /// returned so the connection handler can await its classified
    /// outcome, or abort it (killing any child process) when the client
    /// goes away.
    #[allow(clippy::too_many_arguments)]
    pub fn start_deployment(
        &self,
        trace_id: String,
        app_id: String,
        domain: String,
        repo_url: String,
        branch: String,
        build_command: String,
        port: u16,
        ssh_key: Option<Vec<u8>>,
    ) -> (
        mpsc::Receiver<LogChunk>,
        tokio::task::JoinHandle<Result<(), AgentError>>,
    ) {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let engine = self.engine.clone();

        let spec = DeploymentSpec {
            trace_id,
            app_id,
            domain,
            repo_url,
            branch,
            build_command,
            port,
            ssh_key: ssh_key.map(SecretBytes::new),
        };

        let task = tokio::spawn(async move { engine.run(spec, tx).await });

        (rx, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kari_proto::WireError;

    fn handlers(tmp: &tempfile::TempDir) -> AgentHandlers {
        let root = tmp.path();
        let config = AgentConfig {
            socket_path: root.join("agent.sock"),
            expected_brain_uid: 1001,
            socket_group: "kari".to_string(),
            web_root: root.join("www"),
            web_user: "www-data".to_string(),
            web_group: "www-data".to_string(),
            cert_root: root.join("ssl"),
            services_root: root.join("units"),
            app_root: root.join("apps"),
            sites_root: root.join("sites"),
            releases_per_app_keep: 5,
        };
        AgentHandlers::new(config)
    }

    fn wire_error(response: AgentResponse) -> WireError {
        match response {
            AgentResponse::Error { error } => error,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn activate_site_rejects_blank_site_id() {
        let tmp = tempfile::tempdir().unwrap();
        let h = handlers(&tmp);
        let response = h
            .handle_unary(AgentRequest::ActivateSite {
                site_id: "".to_string(),
                domain: "example.com".to_string(),
                ipv4: None,
                ipv6: None,
                owner_uid: 1001,
                action: SiteActivationAction::CreateSystemUser,
            })
            .await;
        assert_eq!(
            wire_error(response).code,
            kari_proto::AgentErrorCode::Rejected
        );
    }

    #[tokio::test]
    async fn activate_site_rejects_zero_uid() {
        let tmp = tempfile::tempdir().unwrap();
        let h = handlers(&tmp);
        let response = h
            .handle_unary(AgentRequest::ActivateSite {
                site_id: "site-1".to_string(),
                domain: "example.com".to_string(),
                ipv4: None,
                ipv6: None,
                owner_uid: 0,
                action: SiteActivationAction::CreateSystemUser,
            })
            .await;
        assert_eq!(
            wire_error(response).code,
            kari_proto::AgentErrorCode::Rejected
        );
    }

    #[tokio::test]
    async fn https_step_requires_installed_certificate() {
        let tmp = tempfile::tempdir().unwrap();
        let h = handlers(&tmp);
        let response = h
            .handle_unary(AgentRequest::ActivateSite {
                site_id: "site-1".to_string(),
                domain: "example.com".to_string(),
                ipv4: None,
                ipv6: None,
                owner_uid: 1001,
                action: SiteActivationAction::IssueCertificate,
            })
            .await;
        assert_eq!(
            wire_error(response).code,
            kari_proto::AgentErrorCode::Precondition
        );
    }

    #[tokio::test]
    async fn challenge_token_sanitation_is_wired_through() {
        let tmp = tempfile::tempdir().unwrap();
        let h = handlers(&tmp);
        let response = h
            .handle_unary(AgentRequest::PresentChallenge {
                domain: "example.com".to_string(),
                token: "../../../etc/passwd".to_string(),
                key_auth: "ignored".to_string(),
            })
            .await;
        assert_eq!(
            wire_error(response).code,
            kari_proto::AgentErrorCode::Rejected
        );
    }

    #[tokio::test]
    async fn get_system_status_reports_healthy() {
        let tmp = tempfile::tempdir().unwrap();
        let h = handlers(&tmp);
        match h.handle_unary(AgentRequest::GetSystemStatus {}).await {
            AgentResponse::Status { status } => assert!(status.healthy),
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
