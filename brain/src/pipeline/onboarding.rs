//! Server onboarding

use std::sync::Arc;

use kari_proto::SystemCheckReport;
use tracing::info;

use crate::domain::{Actor, Server, CAP_SERVERS_ONBOARD};
use crate::errors::PanelError;
use crate::ports::Agent;

pub struct OnboardingService {
    agent: Arc<dyn Agent>,
}

impl OnboardingService {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }

    /// Validate the server identity, then collect its inventory report.
    pub async fn onboard(
        &self,
        actor: &Actor,
        server: Server,
    ) -> Result<SystemCheckReport, PanelError> {
        actor.require_capability(CAP_SERVERS_ONBOARD)?;
        server.validate()?;
        let report = self.agent.run_system_check(&server.id).await?;
        info!(
            server_id = server.id,
            distro = report.distro,
            "server onboarded"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::inmemory::InMemoryAgent;

    #[tokio::test]
    async fn onboard_returns_the_report() {
        let agent = Arc::new(InMemoryAgent::new());
        let service = OnboardingService::new(agent.clone());

        let report = service
            .onboard(
                &Actor::local_admin(),
                Server {
                    id: "srv-1".to_string(),
                    address: "203.0.113.9".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(report.distro, "ubuntu");
        assert_eq!(agent.calls(), vec!["run_system_check:srv-1"]);
    }

    #[tokio::test]
    async fn blank_server_is_rejected_without_rpc() {
        let agent = Arc::new(InMemoryAgent::new());
        let service = OnboardingService::new(agent.clone());

        let err = service
            .onboard(
                &Actor::local_admin(),
                Server {
                    id: " ".to_string(),
                    address: "203.0.113.9".to_string(),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PanelError::Validation(_)));
        assert!(agent.calls().is_empty());
    }

    #[tokio::test]
    async fn onboarding_requires_the_capability() {
        let agent = Arc::new(InMemoryAgent::new());
        let service = OnboardingService::new(agent.clone());
        let viewer = Actor::new("viewer@example", []);

        let err = service
            .onboard(
                &viewer,
                Server {
                    id: "srv-1".to_string(),
                    address: "203.0.113.9".to_string(),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PanelError::Unauthorized(_)));
        assert!(agent.calls().is_empty());
    }
}
