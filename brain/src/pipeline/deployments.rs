//! Deployment submission
//!
//! The entry point that feeds the deployment queue: an authenticated
//! caller submits a deployment for an existing site, the request is
//! validated, and the record is enqueued for the worker's atomic
//! claim-next-pending loop. Log subscribers attach per deployment
//! through the fan-out hub.

use std::sync::Arc;

use tracing::info;

use crate::domain::{Actor, Deployment, CAP_APPLICATIONS_DEPLOY};
use crate::errors::PanelError;
use crate::ports::{DeploymentRepository, SiteRepository};

/// A caller's request to deploy a new version of a site's application.
pub struct NewDeployment {
    pub site_id: String,
    pub repo_url: String,
    pub branch: String,
    pub build_command: String,
    pub port: u16,
    pub ssh_key: Option<Vec<u8>>,
}

pub struct DeploymentService {
    sites: Arc<dyn SiteRepository>,
    deployments: Arc<dyn DeploymentRepository>,
}

impl DeploymentService {
    pub fn new(sites: Arc<dyn SiteRepository>, deployments: Arc<dyn DeploymentRepository>) -> Self {
        Self { sites, deployments }
    }

    /// Validate and enqueue one deployment. Returns the queued record
    /// with its minted id; the returned copy is scrubbed of the deploy
    /// key, which lives only in the queue until a worker claims it.
    pub async fn submit(
        &self,
        actor: &Actor,
        request: NewDeployment,
    ) -> Result<Deployment, PanelError> {
        actor.require_capability(CAP_APPLICATIONS_DEPLOY)?;
        validate(&request)?;

        let record = self
            .sites
            .get(&request.site_id)
            .await?
            .ok_or_else(|| {
                PanelError::Precondition(format!("unknown site {}", request.site_id))
            })?;

        let mut deployment = Deployment::new(
            &record.site.id,
            &record.site.id,
            &record.site.domain,
            &request.repo_url,
            &request.branch,
            &request.build_command,
            request.port,
        );
        deployment.ssh_key = request.ssh_key;

        self.deployments.enqueue(deployment.clone()).await?;
        deployment.scrub_ssh_key();

        info!(
            deployment_id = deployment.id,
            site_id = deployment.site_id,
            branch = deployment.branch,
            "deployment queued"
        );
        Ok(deployment)
    }

    /// Look up a deployment; the log-subscription route uses this to
    /// refuse subscriptions for ids that were never queued.
    pub async fn get(&self, deployment_id: &str) -> Result<Option<Deployment>, PanelError> {
        self.deployments.get(deployment_id).await
    }
}

fn validate(request: &NewDeployment) -> Result<(), PanelError> {
    if request.site_id.trim().is_empty() {
        return Err(PanelError::Validation("site id is required".to_string()));
    }
    if request.repo_url.trim().is_empty() {
        return Err(PanelError::Validation("repo url is required".to_string()));
    }
    if request.branch.trim().is_empty() {
        return Err(PanelError::Validation("branch is required".to_string()));
    }
    if request.build_command.trim().is_empty() {
        return Err(PanelError::Validation(
            "build command is required".to_string(),
        ));
    }
    if request.repo_url.starts_with('-') || request.branch.starts_with('-') {
        return Err(PanelError::Validation(
            "suspicious git arguments".to_string(),
        ));
    }
    if request.port == 0 {
        return Err(PanelError::Validation("port must be positive".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Site;
    use crate::repo::memory::{InMemoryDeploymentRepository, InMemorySiteRepository};

    fn request() -> NewDeployment {
        NewDeployment {
            site_id: "site-1".to_string(),
            repo_url: "git@github.com:acme/app.git".to_string(),
            branch: "main".to_string(),
            build_command: "npm run build".to_string(),
            port: 3000,
            ssh_key: Some(b"deploy-key".to_vec()),
        }
    }

    async fn service_with_site() -> (Arc<InMemoryDeploymentRepository>, DeploymentService) {
        let sites = Arc::new(InMemorySiteRepository::new());
        sites
            .save(Site {
                id: "site-1".to_string(),
                domain: "example.com".to_string(),
                ipv4: None,
                ipv6: None,
                owner_uid: 1001,
            })
            .await
            .unwrap();

        let deployments = Arc::new(InMemoryDeploymentRepository::new());
        let service = DeploymentService::new(sites, deployments.clone());
        (deployments, service)
    }

    #[tokio::test]
    async fn submit_enqueues_with_site_domain_and_scrubs_the_returned_key() {
        let (deployments, service) = service_with_site().await;

        let queued = service
            .submit(&Actor::local_admin(), request())
            .await
            .unwrap();
        assert!(queued.ssh_key.is_none());
        assert_eq!(queued.domain, "example.com");

        // The queue record still carries the key for the worker.
        let claimed = deployments.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(claimed.id, queued.id);
        assert_eq!(claimed.ssh_key.as_deref(), Some(b"deploy-key".as_slice()));
    }

    #[tokio::test]
    async fn unknown_site_is_a_precondition_failure() {
        let deployments = Arc::new(InMemoryDeploymentRepository::new());
        let service =
            DeploymentService::new(Arc::new(InMemorySiteRepository::new()), deployments.clone());

        let err = service
            .submit(&Actor::local_admin(), request())
            .await
            .unwrap_err();
        assert!(matches!(err, PanelError::Precondition(_)));
        assert!(deployments.claim_next_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_requests_never_reach_the_queue() {
        let (deployments, service) = service_with_site().await;

        for broken in [
            NewDeployment {
                site_id: " ".to_string(),
                ..request()
            },
            NewDeployment {
                repo_url: "".to_string(),
                ..request()
            },
            NewDeployment {
                branch: "-b evil".to_string(),
                ..request()
            },
            NewDeployment {
                build_command: "  ".to_string(),
                ..request()
            },
            NewDeployment {
                port: 0,
                ..request()
            },
        ] {
            let err = service
                .submit(&Actor::local_admin(), broken)
                .await
                .unwrap_err();
            assert!(matches!(err, PanelError::Validation(_)));
        }
        assert!(deployments.claim_next_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn submission_requires_the_capability() {
        let (deployments, service) = service_with_site().await;
        let viewer = Actor::new("viewer@example", []);

        let err = service.submit(&viewer, request()).await.unwrap_err();
        assert!(matches!(err, PanelError::Unauthorized(_)));
        assert!(deployments.claim_next_pending().await.unwrap().is_none());
    }
}
