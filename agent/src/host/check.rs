//! Host system inventory for server onboarding

use std::collections::BTreeMap;

use kari_proto::SystemCheckReport;
use tracing::debug;

use crate::errors::AgentError;
use crate::host::exec;

/// Services the onboarding report inspects.
const PROBED_SERVICES: &[&str] = &["nginx", "postgresql", "ssh"];

/// Collects the onboarding report for `RunSystemCheck`.
#[derive(Clone, Debug, Default)]
pub struct SystemChecker;

impl SystemChecker {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&self, server_id: &str) -> Result<SystemCheckReport, AgentError> {
        if server_id.trim().is_empty() {
            return Err(AgentError::Rejected("server id is required".to_string()));
        }

        let os_release = tokio::fs::read_to_string("/etc/os-release")
            .await
            .unwrap_or_default();
        let (distro, version) = parse_os_release(&os_release);

        let mut services = BTreeMap::new();
        for service in PROBED_SERVICES {
            services.insert(service.to_string(), self.service_status(service).await);
        }

        let (firewall_type, firewall_status) = self.firewall_status().await;

        debug!(server_id, distro, "system check complete");
        Ok(SystemCheckReport {
            distro,
            version,
            services,
            firewall_type,
            firewall_status,
        })
    }

    async fn service_status(&self, service: &str) -> String {
        match exec::run("systemctl", &["is-active", service]).await {
            Ok(output) => {
                let status = output.stdout.trim();
                if status.is_empty() {
                    "unknown".to_string()
                } else {
                    status.to_string()
                }
            }
            Err(_) => "unknown".to_string(),
        }
    }

    async fn firewall_status(&self) -> (String, String) {
        if let Ok(output) = exec::run("ufw", &["status"]).await {
            if output.success() {
                let status = if output.stdout.contains("Status: active") {
                    "active"
                } else {
                    "inactive"
                };
                return ("ufw".to_string(), status.to_string());
            }
        }

        if let Ok(output) = exec::run("firewall-cmd", &["--state"]).await {
            if output.success() {
                return ("firewalld".to_string(), output.stdout.trim().to_string());
            }
        }

        ("none".to_string(), "unknown".to_string())
    }
}

/// Pull `ID` and `VERSION_ID` out of /etc/os-release.
fn parse_os_release(contents: &str) -> (String, String) {
    let mut distro = "unknown".to_string();
    let mut version = "unknown".to_string();

    for line in contents.lines() {
        if let Some(value) = line.strip_prefix("ID=") {
            distro = value.trim_matches('"').to_string();
        } else if let Some(value) = line.strip_prefix("VERSION_ID=") {
            version = value.trim_matches('"').to_string();
        }
    }

    (distro, version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_os_release_fields() {
        let contents = "NAME=\"Ubuntu\"\nID=ubuntu\nVERSION_ID=\"22.04\"\n";
        let (distro, version) = parse_os_release(contents);
        assert_eq!(distro, "ubuntu");
        assert_eq!(version, "22.04");
    }

    #[test]
    fn missing_fields_fall_back_to_unknown() {
        let (distro, version) = parse_os_release("");
        assert_eq!(distro, "unknown");
        assert_eq!(version, "unknown");
    }

    #[tokio::test]
    async fn blank_server_id_is_rejected() {
        let checker = SystemChecker::new();
        let err = checker.run("  ").await.unwrap_err();
        assert!(matches!(err, AgentError::Rejected(_)));
    }
}
