//! In-memory repositories
//!
//! Dev-mode and test persistence. The claim operation holds one lock for
//! select-and-mark, which gives the same single-winner guarantee the
//! Postgres implementation gets from `FOR UPDATE SKIP LOCKED`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::alerts::Alert;
use crate::domain::{Deployment, DeploymentStatus, Site, SiteRecord};
use crate::errors::PanelError;
use crate::ports::{AlertSink, DeploymentRepository, SiteRepository};

#[derive(Default)]
pub struct InMemorySiteRepository {
    records: Mutex<HashMap<String, SiteRecord>>,
}

impl InMemorySiteRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SiteRepository for InMemorySiteRepository {
    async fn save(&self, site: Site) -> Result<(), PanelError> {
        let mut records = self.records.lock().expect("site repo lock");
        let entry = records
            .entry(site.id.clone())
            .or_insert_with(|| SiteRecord {
                site: site.clone(),
                active: false,
                cert_expires_at: None,
            });
        entry.site = site;
        Ok(())
    }

    async fn get(&self, site_id: &str) -> Result<Option<SiteRecord>, PanelError> {
        let records = self.records.lock().expect("site repo lock");
        Ok(records.get(site_id).cloned())
    }

    async fn mark_active(
        &self,
        site_id: &str,
        cert_expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), PanelError> {
        let mut records = self.records.lock().expect("site repo lock");
        let record = records
            .get_mut(site_id)
            .ok_or_else(|| PanelError::Internal(format!("unknown site {site_id}")))?;
        record.active = true;
        if cert_expires_at.is_some() {
            record.cert_expires_at = cert_expires_at;
        }
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<SiteRecord>, PanelError> {
        let records = self.records.lock().expect("site repo lock");
        Ok(records.values().filter(|r| r.active).cloned().collect())
    }
}

#[derive(Default)]
struct DeploymentState {
    deployments: HashMap<String, Deployment>,
    logs: HashMap<String, Vec<String>>,
}

#[derive(Default)]
pub struct InMemoryDeploymentRepository {
    state: Mutex<DeploymentState>,
}

impl InMemoryDeploymentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentRepository for InMemoryDeploymentRepository {
    async fn enqueue(&self, deployment: Deployment) -> Result<(), PanelError> {
        let mut state = self.state.lock().expect("deployment repo lock");
        state
            .deployments
            .insert(deployment.id.clone(), deployment);
        Ok(())
    }

    async fn get(&self, deployment_id: &str) -> Result<Option<Deployment>, PanelError> {
        let state = self.state.lock().expect("deployment repo lock");
        Ok(state.deployments.get(deployment_id).cloned())
    }

    async fn claim_next_pending(&self) -> Result<Option<Deployment>, PanelError> {
        let mut state = self.state.lock().expect("deployment repo lock");

        // Oldest pending first; the selection and the status flip happen
        // under one lock, so exactly one claimer wins.
        let next_id = state
            .deployments
            .values()
            .filter(|d| d.status == DeploymentStatus::Pending)
            .min_by_key(|d| (d.created_at, d.id.clone()))
            .map(|d| d.id.clone());

        let Some(id) = next_id else {
            return Ok(None);
        };

        let deployment = state
            .deployments
            .get_mut(&id)
            .expect("claimed deployment exists");
        deployment.status = DeploymentStatus::Running;
        let claimed = deployment.clone();

        // The in-flight copy is now the only holder of the deploy key.
        deployment.scrub_ssh_key();
        Ok(Some(claimed))
    }

    async fn update_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
    ) -> Result<(), PanelError> {
        let mut state = self.state.lock().expect("deployment repo lock");
        let deployment = state
            .deployments
            .get_mut(deployment_id)
            .ok_or_else(|| PanelError::Internal(format!("unknown deployment {deployment_id}")))?;

        if !deployment.status.can_transition_to(status) {
            return Err(PanelError::Precondition(format!(
                "illegal deployment transition {:?} -> {:?}",
                deployment.status, status
            )));
        }
        deployment.status = status;
        Ok(())
    }

    async fn append_log(&self, deployment_id: &str, line: &str) -> Result<(), PanelError> {
        let mut state = self.state.lock().expect("deployment repo lock");
        state
            .logs
            .entry(deployment_id.to_string())
            .or_default()
            .push(line.to_string());
        Ok(())
    }

    async fn logs(&self, deployment_id: &str) -> Result<Vec<String>, PanelError> {
        let state = self.state.lock().expect("deployment repo lock");
        Ok(state.logs.get(deployment_id).cloned().unwrap_or_default())
    }
}

/// Alert sink that keeps everything in memory for the Action Center
/// endpoint and for tests.
#[derive(Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Alert> {
        self.alerts.lock().expect("alert lock").clone()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn record(&self, alert: Alert) {
        tracing::warn!(
            source = alert.source,
            subject = alert.subject,
            category = alert.category,
            message = alert.message,
            "system alert recorded"
        );
        self.alerts.lock().expect("alert lock").push(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn deployment(site: &str, created_offset_secs: i64) -> Deployment {
        let mut d = Deployment::new(
            site,
            site,
            "example.com",
            "https://example.com/repo.git",
            "main",
            "npm run build",
            3000,
        );
        d.created_at = Utc::now() + chrono::Duration::seconds(created_offset_secs);
        d
    }

    #[tokio::test]
    async fn claim_takes_the_oldest_pending_and_marks_it_running() {
        let repo = InMemoryDeploymentRepository::new();
        let older = deployment("site-a", -60);
        let newer = deployment("site-b", 0);
        let older_id = older.id.clone();

        repo.enqueue(newer).await.unwrap();
        repo.enqueue(older).await.unwrap();

        let claimed = repo.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(claimed.id, older_id);
        assert_eq!(claimed.status, DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn claim_moves_the_deploy_key_to_the_claimed_copy() {
        let repo = InMemoryDeploymentRepository::new();
        let mut queued = deployment("site-a", 0);
        queued.ssh_key = Some(b"deploy-key".to_vec());
        let id = queued.id.clone();
        repo.enqueue(queued).await.unwrap();

        let claimed = repo.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(claimed.ssh_key.as_deref(), Some(b"deploy-key".as_slice()));

        // The stored record no longer carries the key.
        let stored = repo.get(&id).await.unwrap().unwrap();
        assert!(stored.ssh_key.is_none());
    }

    #[tokio::test]
    async fn concurrent_claimers_never_share_a_deployment() {
        let repo = Arc::new(InMemoryDeploymentRepository::new());
        for i in 0..10 {
            repo.enqueue(deployment(&format!("site-{i}"), i)).await.unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let repo = repo.clone();
            tasks.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(d) = repo.claim_next_pending().await.unwrap() {
                    claimed.push(d.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        all.sort();
        let before = all.len();
        all.dedup();
        assert_eq!(before, 10, "every deployment claimed exactly once");
        assert_eq!(all.len(), 10);
    }

    #[tokio::test]
    async fn illegal_status_transitions_are_refused() {
        let repo = InMemoryDeploymentRepository::new();
        let d = deployment("site-a", 0);
        let id = d.id.clone();
        repo.enqueue(d).await.unwrap();

        // pending -> success skips running.
        let err = repo
            .update_status(&id, DeploymentStatus::Success)
            .await
            .unwrap_err();
        assert!(matches!(err, PanelError::Precondition(_)));

        repo.claim_next_pending().await.unwrap();
        repo.update_status(&id, DeploymentStatus::Success)
            .await
            .unwrap();

        // Terminal states stay terminal.
        let err = repo
            .update_status(&id, DeploymentStatus::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, PanelError::Precondition(_)));
    }

    #[tokio::test]
    async fn sites_only_become_active_when_marked() {
        let repo = InMemorySiteRepository::new();
        let site = Site {
            id: "site-1".to_string(),
            domain: "example.com".to_string(),
            ipv4: None,
            ipv6: None,
            owner_uid: 1001,
        };

        repo.save(site.clone()).await.unwrap();
        assert!(!repo.get("site-1").await.unwrap().unwrap().active);
        assert!(repo.list_active().await.unwrap().is_empty());

        repo.mark_active("site-1", None).await.unwrap();
        assert!(repo.get("site-1").await.unwrap().unwrap().active);
        assert_eq!(repo.list_active().await.unwrap().len(), 1);
    }
}
