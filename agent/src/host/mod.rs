//! Host execution layer: everything that touches the machine.

pub mod certs;
pub mod challenge;
pub mod check;
pub mod exec;
pub mod jail;
pub mod proxy;
pub mod releases;
pub mod units;

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::AgentError;

/// DNS label charset and length, anchored; rejects anything that could
/// terminate a config directive or escape a path.
static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)+$")
        .expect("domain regex")
});

/// Validate a domain name before it is used in any path or template.
pub fn validate_domain(domain: &str) -> Result<(), AgentError> {
    if domain.len() > 253 || !DOMAIN_RE.is_match(domain) {
        return Err(AgentError::Rejected(format!(
            "invalid domain name: {domain:?}"
        )));
    }
    Ok(())
}

/// Validate the name of an application jail user.
pub fn validate_username(username: &str) -> Result<(), AgentError> {
    let ok = !username.is_empty()
        && username.len() <= 32
        && username
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && username.starts_with(|c: char| c.is_ascii_lowercase());
    if !ok {
        return Err(AgentError::Rejected(format!(
            "invalid username: {username:?}"
        )));
    }
    Ok(())
}

/// Validate an application identifier before it becomes part of a path.
pub fn validate_app_id(app_id: &str) -> Result<(), AgentError> {
    let ok = !app_id.is_empty()
        && app_id.len() <= 64
        && app_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !ok {
        return Err(AgentError::Rejected(format!("invalid app id: {app_id:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_normal_domains() {
        assert!(validate_domain("example.com").is_ok());
        assert!(validate_domain("a-b.sub.example.co.uk").is_ok());
    }

    #[test]
    fn rejects_injection_attempts() {
        assert!(validate_domain("example.com;").is_err());
        assert!(validate_domain("example.com\nserver_name evil").is_err());
        assert!(validate_domain("../etc/nginx").is_err());
        assert!(validate_domain("EXAMPLE.COM").is_err());
        assert!(validate_domain("nodots").is_err());
    }

    #[test]
    fn rejects_bad_usernames() {
        assert!(validate_username("kari-app-blog").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("UPPER").is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username("-leading").is_err());
    }
}
