//! Certificate auto-renewal
//!
//! Daily sweep over active sites: anything expiring within the threshold
//! is re-issued and re-installed through the agent. Failures raise
//! critical alerts and never take the worker down.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};
use zeroize::Zeroize;

use crate::alerts::Alert;
use crate::ports::{Agent, AlertSink, CertificateAuthority, SiteRepository};

/// Renewal worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Sweep interval
    pub interval: Duration,
    /// Renew certificates that expire within this many days.
    pub renew_within_days: i64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(24 * 60 * 60),
            renew_within_days: 30,
        }
    }
}

/// Run the renewal worker until shutdown.
pub async fn run<S, F>(
    options: &Options,
    sites: Arc<dyn SiteRepository>,
    ca: Arc<dyn CertificateAuthority>,
    agent: Arc<dyn Agent>,
    alerts: Arc<dyn AlertSink>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("SSL renewal worker starting...");

    sweep(options, &sites, &ca, &agent, &alerts).await;

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("SSL renewal worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {
                sweep(options, &sites, &ca, &agent, &alerts).await;
            }
        }
    }
}

/// One expiry sweep. Public so tests can run it without the timer loop.
pub async fn sweep(
    options: &Options,
    sites: &Arc<dyn SiteRepository>,
    ca: &Arc<dyn CertificateAuthority>,
    agent: &Arc<dyn Agent>,
    alerts: &Arc<dyn AlertSink>,
) {
    let records = match sites.list_active().await {
        Ok(records) => records,
        Err(e) => {
            error!(error = %e, "failed to list active sites for renewal");
            return;
        }
    };

    let deadline = Utc::now() + chrono::Duration::days(options.renew_within_days);
    let mut renewed = 0usize;
    let mut failed = 0usize;

    for record in records {
        let due = match record.cert_expires_at {
            Some(expiry) => expiry <= deadline,
            // No recorded expiry on an active site: treat as due rather
            // than let it lapse silently.
            None => true,
        };
        if !due {
            continue;
        }

        let domain = record.site.domain.clone();
        info!(domain, "certificate expiring soon, renewing");

        match renew_one(record.site.id.as_str(), &domain, sites, ca, agent).await {
            Ok(()) => renewed += 1,
            Err(e) => {
                failed += 1;
                error!(domain, error = %e, "certificate renewal failed");
                alerts
                    .record(Alert::critical(
                        "ssl_renewal",
                        &domain,
                        e.kind(),
                        e.operator_message(),
                    ))
                    .await;
            }
        }
    }

    if renewed > 0 || failed > 0 {
        info!(renewed, failed, "ssl renewal sweep completed");
    }
}

async fn renew_one(
    site_id: &str,
    domain: &str,
    sites: &Arc<dyn SiteRepository>,
    ca: &Arc<dyn CertificateAuthority>,
    agent: &Arc<dyn Agent>,
) -> Result<(), crate::errors::PanelError> {
    let mut material = ca.issue(domain).await?;
    let expires_at = material.expires_at;

    let install = agent
        .install_certificate(crate::domain::CertificateMaterial {
            domain: material.domain.clone(),
            fullchain_pem: material.fullchain_pem.clone(),
            privkey_pem: material.privkey_pem.clone(),
            expires_at,
        })
        .await;
    material.privkey_pem.zeroize();
    install?;

    sites.mark_active(site_id, Some(expires_at)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::InMemoryCertificateAuthority;
    use crate::agent::inmemory::InMemoryAgent;
    use crate::domain::Site;
    use crate::repo::memory::{InMemorySiteRepository, MemoryAlertSink};

    fn site(id: &str, domain: &str) -> Site {
        Site {
            id: id.to_string(),
            domain: domain.to_string(),
            ipv4: Some("203.0.113.10".to_string()),
            ipv6: None,
            owner_uid: 1001,
        }
    }

    #[tokio::test]
    async fn renews_only_certificates_near_expiry() {
        let sites_impl = Arc::new(InMemorySiteRepository::new());
        let sites: Arc<dyn SiteRepository> = sites_impl.clone();
        let ca_impl = Arc::new(InMemoryCertificateAuthority::new());
        let ca: Arc<dyn CertificateAuthority> = ca_impl.clone();
        let agent: Arc<dyn Agent> = Arc::new(InMemoryAgent::new());
        let alerts: Arc<dyn AlertSink> = Arc::new(MemoryAlertSink::new());

        // One certificate about to lapse, one comfortably valid.
        sites.save(site("due", "due.example.com")).await.unwrap();
        sites
            .mark_active("due", Some(Utc::now() + chrono::Duration::days(5)))
            .await
            .unwrap();
        sites.save(site("fresh", "fresh.example.com")).await.unwrap();
        sites
            .mark_active("fresh", Some(Utc::now() + chrono::Duration::days(80)))
            .await
            .unwrap();

        sweep(&Options::default(), &sites, &ca, &agent, &alerts).await;

        assert_eq!(ca_impl.issued_domains(), vec!["due.example.com"]);

        // The renewed site's recorded expiry moved forward.
        let record = sites_impl.get("due").await.unwrap().unwrap();
        assert!(record.cert_expires_at.unwrap() > Utc::now() + chrono::Duration::days(60));
    }
}
