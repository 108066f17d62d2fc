//! Sites and certificate material

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::PanelError;

/// A to-be-deployed application. Immutable through activation; a failed
/// pipeline leaves no site recorded as active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub domain: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    /// The unprivileged Linux UID that will own runtime files.
    pub owner_uid: u32,
}

impl Site {
    /// Pre-conditions checked before any RPC leaves the brain.
    pub fn validate(&self) -> Result<(), PanelError> {
        if self.id.trim().is_empty() {
            return Err(PanelError::Validation("site id is required".to_string()));
        }
        if self.domain.trim().is_empty() {
            return Err(PanelError::Validation(
                "site domain is required".to_string(),
            ));
        }
        if self.owner_uid == 0 {
            return Err(PanelError::Validation(
                "site owner uid must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A site as the repository stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteRecord {
    pub site: Site,
    pub active: bool,
    /// Expiry of the installed certificate, recorded at issuance so the
    /// renewal sweep needs no X.509 parsing.
    pub cert_expires_at: Option<DateTime<Utc>>,
}

/// Freshly issued certificate material on its way to the agent.
///
/// The private key buffer is zeroized by whoever consumes it; the brain
/// never stores it.
pub struct CertificateMaterial {
    pub domain: String,
    pub fullchain_pem: Vec<u8>,
    pub privkey_pem: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> Site {
        Site {
            id: "site-1".to_string(),
            domain: "example.com".to_string(),
            ipv4: Some("203.0.113.10".to_string()),
            ipv6: None,
            owner_uid: 1001,
        }
    }

    #[test]
    fn valid_site_passes() {
        assert!(site().validate().is_ok());
    }

    #[test]
    fn blank_fields_and_zero_uid_fail_validation() {
        let mut s = site();
        s.id = "   ".to_string();
        assert!(matches!(s.validate(), Err(PanelError::Validation(_))));

        let mut s = site();
        s.domain = "".to_string();
        assert!(matches!(s.validate(), Err(PanelError::Validation(_))));

        let mut s = site();
        s.owner_uid = 0;
        assert!(matches!(s.validate(), Err(PanelError::Validation(_))));
    }
}
