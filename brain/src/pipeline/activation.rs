//! Site-activation pipeline
//!
//! The strictly ordered walk from "requested" to "live behind TLS":
//! system user → HTTP vhost → DNS records → certificate → HTTPS vhost,
//! and only then is the site recorded active. A failure at any step
//! aborts the walk, raises a critical alert, and leaves the site
//! inactive; earlier side effects stay in place and every step is
//! idempotent on re-invocation.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::alerts::Alert;
use crate::domain::{Actor, Site, CAP_APPLICATIONS_DEPLOY};
use crate::errors::PanelError;
use crate::ports::{Agent, AlertSink, CertificateAuthority, DnsProvider, SiteRepository};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Certificates further than this from expiry are not re-issued when the
/// pipeline runs again over an already-activated site.
const REISSUE_THRESHOLD_DAYS: i64 = 30;

pub struct ActivationPipeline {
    agent: Arc<dyn Agent>,
    dns: Arc<dyn DnsProvider>,
    ca: Arc<dyn CertificateAuthority>,
    sites: Arc<dyn SiteRepository>,
    alerts: Arc<dyn AlertSink>,
    backoff: CooldownOptions,
}

impl ActivationPipeline {
    pub fn new(
        agent: Arc<dyn Agent>,
        dns: Arc<dyn DnsProvider>,
        ca: Arc<dyn CertificateAuthority>,
        sites: Arc<dyn SiteRepository>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            agent,
            dns,
            ca,
            sites,
            alerts,
            backoff: CooldownOptions::default(),
        }
    }

    /// Validate and run the full pipeline for one site.
    pub async fn activate(&self, actor: &Actor, site: Site) -> Result<(), PanelError> {
        // Rejected before any RPC leaves the brain.
        actor.require_capability(CAP_APPLICATIONS_DEPLOY)?;
        site.validate()?;

        self.sites.save(site.clone()).await?;

        match self.run_steps(&site).await {
            Ok(cert_expires_at) => {
                self.sites.mark_active(&site.id, cert_expires_at).await?;
                info!(site_id = site.id, domain = site.domain, "site activated");
                Ok(())
            }
            Err(e) => {
                warn!(
                    site_id = site.id,
                    domain = site.domain,
                    kind = e.kind().as_str(),
                    error = %e,
                    "site activation failed"
                );
                self.alerts
                    .record(Alert::critical(
                        "site_activation",
                        &site.id,
                        e.kind(),
                        e.operator_message(),
                    ))
                    .await;
                Err(e)
            }
        }
    }

    async fn run_steps(&self, site: &Site) -> Result<Option<DateTime<Utc>>, PanelError> {
        self.step(|| self.agent.create_system_user(site)).await?;
        self.step(|| self.agent.apply_http_vhost(site)).await?;
        self.step(|| self.dns.ensure_address_records(site)).await?;
        let cert_expires_at = self.certificate_step(site).await?;
        self.step(|| self.agent.apply_https_vhost(site)).await?;
        Ok(cert_expires_at)
    }

    /// Obtain and install certificate material, then send the
    /// confirmation intent. A still-valid certificate from a previous run
    /// is left alone so re-activation stays idempotent.
    async fn certificate_step(&self, site: &Site) -> Result<Option<DateTime<Utc>>, PanelError> {
        let existing = self.sites.get(&site.id).await?;
        let still_valid = existing
            .and_then(|record| record.cert_expires_at)
            .filter(|expiry| *expiry > Utc::now() + Duration::days(REISSUE_THRESHOLD_DAYS));

        let expires_at = if let Some(expiry) = still_valid {
            info!(
                domain = site.domain,
                %expiry,
                "certificate still valid, skipping re-issuance"
            );
            Some(expiry)
        } else {
            let mut material = self.ca.issue(&site.domain).await?;
            let expires_at = material.expires_at;

            // The agent zeroizes its copy after the write; this local
            // copy exists only to survive a transient install retry and
            // is scrubbed on every path out.
            let mut privkey_copy = material.privkey_pem.clone();
            let install_result = self
                .step(|| {
                    let retry_material = crate::domain::CertificateMaterial {
                        domain: material.domain.clone(),
                        fullchain_pem: material.fullchain_pem.clone(),
                        privkey_pem: privkey_copy.clone(),
                        expires_at: material.expires_at,
                    };
                    self.agent.install_certificate(retry_material)
                })
                .await;

            material.privkey_pem.zeroize();
            privkey_copy.zeroize();
            install_result?;

            Some(expires_at)
        };

        self.step(|| self.agent.issue_certificate(site)).await?;
        Ok(expires_at)
    }

    /// Run one step, retrying exactly once (with backoff) when the
    /// failure is transient. Everything else aborts the pipeline.
    async fn step<'a, F, Fut>(&'a self, op: F) -> Result<(), PanelError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<(), PanelError>> + 'a,
    {
        match op().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                let delay = calc_exp_backoff(&self.backoff, 0);
                warn!(error = %e, ?delay, "transient step failure, retrying once");
                tokio::time::sleep(delay).await;
                op().await
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::InMemoryCertificateAuthority;
    use crate::agent::inmemory::InMemoryAgent;
    use crate::dns::InMemoryDnsProvider;
    use crate::repo::memory::{InMemorySiteRepository, MemoryAlertSink};

    struct Fixture {
        agent: Arc<InMemoryAgent>,
        dns: Arc<InMemoryDnsProvider>,
        ca: Arc<InMemoryCertificateAuthority>,
        sites: Arc<InMemorySiteRepository>,
        alerts: Arc<MemoryAlertSink>,
        pipeline: ActivationPipeline,
    }

    fn fixture() -> Fixture {
        let agent = Arc::new(InMemoryAgent::new());
        let dns = Arc::new(InMemoryDnsProvider::new());
        let ca = Arc::new(InMemoryCertificateAuthority::new());
        let sites = Arc::new(InMemorySiteRepository::new());
        let alerts = Arc::new(MemoryAlertSink::new());
        let pipeline = ActivationPipeline::new(
            agent.clone(),
            dns.clone(),
            ca.clone(),
            sites.clone(),
            alerts.clone(),
        );
        Fixture {
            agent,
            dns,
            ca,
            sites,
            alerts,
            pipeline,
        }
    }

    fn site() -> Site {
        Site {
            id: "site-1".to_string(),
            domain: "example.com".to_string(),
            ipv4: Some("203.0.113.10".to_string()),
            ipv6: None,
            owner_uid: 1001,
        }
    }

    #[tokio::test]
    async fn happy_path_runs_the_four_intents_in_order() {
        let f = fixture();
        f.pipeline.activate(&Actor::local_admin(), site()).await.unwrap();

        let calls = f.agent.calls();
        let intent_order: Vec<&str> = calls
            .iter()
            .map(String::as_str)
            .filter(|c| {
                matches!(
                    *c,
                    "create_system_user"
                        | "apply_http_vhost"
                        | "issue_certificate"
                        | "apply_https_vhost"
                )
            })
            .collect();
        assert_eq!(
            intent_order,
            vec![
                "create_system_user",
                "apply_http_vhost",
                "issue_certificate",
                "apply_https_vhost",
            ]
        );

        // Certificate material was installed before the HTTPS vhost.
        let install_pos = calls
            .iter()
            .position(|c| c == "install_certificate:example.com")
            .expect("certificate installed");
        let https_pos = calls
            .iter()
            .position(|c| c == "apply_https_vhost")
            .unwrap();
        assert!(install_pos < https_pos);

        // DNS ran, and the site is recorded active with a cert expiry.
        assert_eq!(f.dns.ensured_domains(), vec!["example.com"]);
        let record = f.sites.get("site-1").await.unwrap().unwrap();
        assert!(record.active);
        assert!(record.cert_expires_at.is_some());
        assert!(f.alerts.all().is_empty());
    }

    #[tokio::test]
    async fn missing_capability_is_unauthorized_with_zero_rpcs() {
        let f = fixture();
        let viewer = Actor::new("viewer@example", ["applications.view".to_string()]);

        let err = f.pipeline.activate(&viewer, site()).await.unwrap_err();
        assert!(matches!(err, PanelError::Unauthorized(_)));
        assert!(f.agent.calls().is_empty());
    }

    #[tokio::test]
    async fn validation_failure_issues_zero_rpcs() {
        let f = fixture();
        let mut bad = site();
        bad.id = "".to_string();

        let err = f.pipeline.activate(&Actor::local_admin(), bad).await.unwrap_err();
        assert!(matches!(err, PanelError::Validation(_)));
        assert!(f.agent.calls().is_empty());
        assert!(f.dns.ensured_domains().is_empty());
    }

    #[tokio::test]
    async fn dns_failure_aborts_before_certificate_and_records_alert() {
        struct FailingDns;

        #[async_trait::async_trait]
        impl DnsProvider for FailingDns {
            async fn ensure_address_records(&self, _site: &Site) -> Result<(), PanelError> {
                Err(PanelError::Precondition("zone is not delegated".to_string()))
            }
        }

        let agent = Arc::new(InMemoryAgent::new());
        let ca = Arc::new(InMemoryCertificateAuthority::new());
        let sites = Arc::new(InMemorySiteRepository::new());
        let alerts = Arc::new(MemoryAlertSink::new());
        let pipeline = ActivationPipeline::new(
            agent.clone(),
            Arc::new(FailingDns),
            ca.clone(),
            sites.clone(),
            alerts.clone(),
        );

        let err = pipeline.activate(&Actor::local_admin(), site()).await.unwrap_err();
        assert!(matches!(err, PanelError::Precondition(_)));

        // Steps 1 and 2 ran; nothing past the DNS step did.
        let calls = agent.calls();
        assert!(calls.contains(&"create_system_user".to_string()));
        assert!(calls.contains(&"apply_http_vhost".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("install_certificate")));
        assert!(!calls.contains(&"apply_https_vhost".to_string()));
        assert!(ca.issued_domains().is_empty());

        // Site stays inactive; one critical alert recorded.
        let record = sites.get("site-1").await.unwrap().unwrap();
        assert!(!record.active);
        assert_eq!(alerts.all().len(), 1);
    }

    #[tokio::test]
    async fn reactivation_skips_reissuing_a_valid_certificate() {
        let f = fixture();
        f.pipeline.activate(&Actor::local_admin(), site()).await.unwrap();
        assert_eq!(f.ca.issued_domains().len(), 1);

        f.pipeline.activate(&Actor::local_admin(), site()).await.unwrap();
        // Second run is idempotent: intents repeat, issuance does not.
        assert_eq!(f.ca.issued_domains().len(), 1);
    }
}
