//! DNS providers

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::domain::Site;
use crate::errors::PanelError;
use crate::ports::DnsProvider;

/// Dev/test DNS provider: records what it was asked to publish and
/// reports success. Real providers (Route53, Cloudflare) implement the
/// same trait behind their own crates.
#[derive(Default)]
pub struct InMemoryDnsProvider {
    ensured: Mutex<Vec<(String, Option<String>, Option<String>)>>,
}

impl InMemoryDnsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensured_domains(&self) -> Vec<String> {
        self.ensured
            .lock()
            .expect("dns lock")
            .iter()
            .map(|(domain, _, _)| domain.clone())
            .collect()
    }
}

#[async_trait]
impl DnsProvider for InMemoryDnsProvider {
    async fn ensure_address_records(&self, site: &Site) -> Result<(), PanelError> {
        info!(
            domain = site.domain,
            ipv4 = ?site.ipv4,
            ipv6 = ?site.ipv6,
            "ensured address records"
        );
        self.ensured.lock().expect("dns lock").push((
            site.domain.clone(),
            site.ipv4.clone(),
            site.ipv6.clone(),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(ipv4: Option<&str>) -> Site {
        Site {
            id: "site-1".to_string(),
            domain: "example.com".to_string(),
            ipv4: ipv4.map(str::to_string),
            ipv6: None,
            owner_uid: 1001,
        }
    }

    #[tokio::test]
    async fn records_published_domains() {
        let dns = InMemoryDnsProvider::new();
        dns.ensure_address_records(&site(Some("203.0.113.10")))
            .await
            .unwrap();
        dns.ensure_address_records(&site(None)).await.unwrap();
        assert_eq!(dns.ensured_domains(), vec!["example.com", "example.com"]);
    }
}
