//! Reverse-proxy vhost configuration
//!
//! Generated configs are staged as a sibling `.tmp`, atomically renamed
//! into the live directory, then checked with the proxy's offline syntax
//! checker before any reload. A failed check restores the previous config
//! so a broken file is never left enabled and never reloaded.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::errors::AgentError;
use crate::host::{exec, validate_domain};

/// Manages nginx vhost files under the sites-enabled directory.
#[derive(Clone, Debug)]
pub struct ProxyManager {
    sites_root: PathBuf,
}

impl ProxyManager {
    pub fn new(sites_root: PathBuf) -> Self {
        Self { sites_root }
    }

    fn vhost_path(&self, domain: &str) -> PathBuf {
        self.sites_root.join(format!("{domain}.conf"))
    }

    /// Plain-HTTP vhost: proxies to the app port and serves the ACME
    /// challenge directory from the web root.
    pub fn render_http_vhost(domain: &str, port: u16, web_root: &str) -> String {
        format!(
            r#"server {{
    listen 80;
    listen [::]:80;
    server_name {domain};

    location /.well-known/acme-challenge/ {{
        root {web_root};
        default_type text/plain;
    }}

    location / {{
        proxy_pass http://127.0.0.1:{port};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
    }}
}}
"#
        )
    }

    /// TLS vhost: terminates HTTPS with the installed chain and redirects
    /// plain HTTP, keeping the challenge path reachable for renewals.
    pub fn render_https_vhost(
        domain: &str,
        port: u16,
        web_root: &str,
        fullchain: &str,
        privkey: &str,
    ) -> String {
        format!(
            r#"server {{
    listen 80;
    listen [::]:80;
    server_name {domain};

    location /.well-known/acme-challenge/ {{
        root {web_root};
        default_type text/plain;
    }}

    location / {{
        return 301 https://$host$request_uri;
    }}
}}

server {{
    listen 443 ssl;
    listen [::]:443 ssl;
    server_name {domain};

    ssl_certificate {fullchain};
    ssl_certificate_key {privkey};
    ssl_protocols TLSv1.2 TLSv1.3;

    add_header X-Content-Type-Options "nosniff" always;
    add_header X-Frame-Options "SAMEORIGIN" always;

    location / {{
        proxy_pass http://127.0.0.1:{port};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
    }}
}}
"#
        )
    }

    /// Install a vhost for the domain: stage, atomic rename, syntax-check,
    /// reload. On a failed check the previous content (if any) is restored
    /// and the error is classified as an integrity failure.
    pub async fn apply_vhost(&self, domain: &str, contents: &str) -> Result<(), AgentError> {
        validate_domain(domain)?;

        let live = self.vhost_path(domain);
        let staged = self.sites_root.join(format!("{domain}.conf.tmp"));

        let previous = match tokio::fs::read(&live).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        tokio::fs::write(&staged, contents).await?;
        tokio::fs::rename(&staged, &live).await?;

        if let Err(check_err) = self.config_check().await {
            warn!(domain, error = %check_err, "generated vhost failed syntax check, rolling back");
            match previous {
                Some(bytes) => tokio::fs::write(&live, bytes).await?,
                None => tokio::fs::remove_file(&live).await?,
            }
            return Err(AgentError::Integrity(format!(
                "vhost for {domain} rejected by nginx -t"
            )));
        }

        self.reload().await?;
        info!(domain, "applied vhost configuration");
        Ok(())
    }

    /// Offline syntax check of the full proxy configuration.
    async fn config_check(&self) -> Result<(), AgentError> {
        exec::run_checked("nginx", &["-t"]).await?;
        Ok(())
    }

    /// Reload through the service manager, never by signalling PIDs.
    async fn reload(&self) -> Result<(), AgentError> {
        exec::run_checked("systemctl", &["reload", "nginx"]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_vhost_references_domain_and_port() {
        let conf = ProxyManager::render_http_vhost("example.com", 3000, "/var/www");
        assert!(conf.contains("server_name example.com;"));
        assert!(conf.contains("proxy_pass http://127.0.0.1:3000;"));
        assert!(conf.contains(".well-known/acme-challenge"));
        assert!(!conf.contains("443"));
    }

    #[test]
    fn https_vhost_wires_in_the_chain() {
        let conf = ProxyManager::render_https_vhost(
            "example.com",
            3000,
            "/var/www",
            "/etc/kari/ssl/example.com/fullchain.pem",
            "/etc/kari/ssl/example.com/privkey.pem",
        );
        assert!(conf.contains("listen 443 ssl;"));
        assert!(conf.contains("ssl_certificate /etc/kari/ssl/example.com/fullchain.pem;"));
        assert!(conf.contains("ssl_certificate_key /etc/kari/ssl/example.com/privkey.pem;"));
        assert!(conf.contains("return 301 https://$host$request_uri;"));
    }

    #[test]
    fn regeneration_is_byte_identical() {
        let a = ProxyManager::render_http_vhost("example.com", 3000, "/var/www");
        let b = ProxyManager::render_http_vhost("example.com", 3000, "/var/www");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn apply_vhost_rejects_bad_domains_before_touching_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = ProxyManager::new(tmp.path().to_path_buf());

        let err = mgr
            .apply_vhost("bad;domain", "server {}")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Rejected(_)));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
