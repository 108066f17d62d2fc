//! Actors and capabilities
//!
//! Authentication happens upstream; the core receives an already-verified
//! actor identity and a set of granted capabilities. Capabilities are
//! opaque strings checked for presence, never interpreted into roles.

use std::collections::BTreeSet;

use crate::errors::PanelError;

pub type Capability = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    capabilities: BTreeSet<Capability>,
}

/// Capability required to activate and deploy applications.
pub const CAP_APPLICATIONS_DEPLOY: &str = "applications.deploy";

/// Capability required to onboard servers.
pub const CAP_SERVERS_ONBOARD: &str = "servers.onboard";

impl Actor {
    pub fn new(id: impl Into<String>, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().collect(),
        }
    }

    /// The single-operator identity used when no upstream authenticator
    /// has attached an actor (local and dev deployments).
    pub fn local_admin() -> Self {
        Self::new(
            "local-admin",
            [
                CAP_APPLICATIONS_DEPLOY.to_string(),
                CAP_SERVERS_ONBOARD.to_string(),
            ],
        )
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Presence check used by the services; a missing grant is an
    /// authorization failure, not a validation failure.
    pub fn require_capability(&self, capability: &str) -> Result<(), PanelError> {
        if self.has_capability(capability) {
            return Ok(());
        }
        Err(PanelError::Unauthorized(format!(
            "actor {} lacks capability {capability}",
            self.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_presence_is_checked_literally() {
        let actor = Actor::new("ops@example", ["applications.deploy".to_string()]);
        assert!(actor.require_capability("applications.deploy").is_ok());
        assert!(matches!(
            actor.require_capability("servers.onboard"),
            Err(PanelError::Unauthorized(_))
        ));
    }
}
