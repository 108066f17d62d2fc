//! The streaming deployment engine
//!
//! One `StreamDeployment` request drives: new release directory → shallow
//! clone → ownership handoff → jailed build → service unit refresh →
//! atomic `current` swap → restart → prune. Progress is narrated into the
//! log channel; the terminal EOF chunk is always the last thing sent.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use kari_proto::LogChunk;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::errors::AgentError;
use crate::host::jail::JailManager;
use crate::host::releases::{release_name, AppTree};
use crate::host::units::{ServiceManager, ServiceUnit};
use crate::host::{validate_app_id, validate_domain};
use crate::secrets::SecretBytes;
use crate::deploy::{build, git};

/// Everything the engine needs to run one deployment.
pub struct DeploymentSpec {
    pub trace_id: String,
    pub app_id: String,
    pub domain: String,
    pub repo_url: String,
    pub branch: String,
    pub build_command: String,
    pub port: u16,
    pub ssh_key: Option<SecretBytes>,
}

/// Executes deployments against the host.
#[derive(Clone)]
pub struct DeployEngine {
    jail: JailManager,
    services: ServiceManager,
    app_root: PathBuf,
    releases_keep: usize,
}

impl DeployEngine {
    pub fn new(
        jail: JailManager,
        services: ServiceManager,
        app_root: PathBuf,
        releases_keep: usize,
    ) -> Self {
        Self {
            jail,
            services,
            app_root,
            releases_keep,
        }
    }

    /// Run the deployment, narrating into `log_tx`.
    ///
    /// Success ends with the terminal EOF chunk. Failure returns the
    /// classified error; the connection handler turns it into the
    /// stream's final error frame and the brain renders the tagged
    /// terminal line from it.
    pub async fn run(
        &self,
        spec: DeploymentSpec,
        log_tx: mpsc::Sender<LogChunk>,
    ) -> Result<(), AgentError> {
        let trace_id = spec.trace_id.clone();

        match self.run_inner(spec, &log_tx).await {
            Ok(()) => {
                let _ = log_tx.try_send(LogChunk::system(&trace_id, "Deployment complete.\n"));
                let _ = log_tx.try_send(LogChunk::eof(&trace_id));
                Ok(())
            }
            Err(e) => {
                error!(trace_id, error = %e, "deployment failed");
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        spec: DeploymentSpec,
        log_tx: &mpsc::Sender<LogChunk>,
    ) -> Result<(), AgentError> {
        validate_app_id(&spec.app_id)?;
        validate_domain(&spec.domain)?;

        let username = JailManager::username_for(&spec.app_id);
        let uid = self.require_jail_uid(&spec.app_id).await?;

        let tree = AppTree::new(self.app_root.join(&spec.app_id));
        let release = release_name(Utc::now());
        let release_dir = tree.release_dir(&release);

        let narrate = |msg: String| {
            let _ = log_tx.try_send(LogChunk::system(&spec.trace_id, msg));
        };

        narrate(format!("Creating release {release}...\n"));
        self.jail.secure_dir(&tree.releases_dir(), uid).await?;

        narrate(format!("Cloning {} ({})...\n", spec.repo_url, spec.branch));
        if let Err(e) = git::clone_repo(
            &spec.repo_url,
            &spec.branch,
            &release_dir,
            spec.ssh_key,
        )
        .await
        {
            let _ = tokio::fs::remove_dir_all(&release_dir).await;
            return Err(e);
        }
        self.jail.own_tree(&release_dir, uid).await?;

        narrate("Starting jailed build...\n".to_string());
        let build_argv = build::split_command(&spec.build_command);
        let env: HashMap<String, String> =
            HashMap::from([("PORT".to_string(), spec.port.to_string())]);
        if let Err(e) = build::execute_build(
            &build_argv,
            &release_dir,
            &username,
            &env,
            log_tx.clone(),
            &spec.trace_id,
        )
        .await
        {
            let _ = tokio::fs::remove_dir_all(&release_dir).await;
            return Err(e);
        }

        narrate("Build successful. Swapping release...\n".to_string());
        tree.activate_release(&release).await?;

        let current = tree.current_link();
        let unit = ServiceUnit {
            service_name: ServiceManager::service_name_for(&spec.app_id),
            username: username.clone(),
            working_directory: current.to_string_lossy().to_string(),
            exec_start: vec![current.join("start.sh").to_string_lossy().to_string()],
            env_vars: BTreeMap::from([("PORT".to_string(), spec.port.to_string())]),
        };
        self.services.install_unit(&unit).await?;
        self.services.daemon_reload().await?;
        self.services.enable_and_restart(&unit.service_name).await?;

        narrate("Pruning old releases...\n".to_string());
        let deleted = tree.prune_releases(self.releases_keep).await?;
        if !deleted.is_empty() {
            narrate(format!("Removed {} old release(s).\n", deleted.len()));
        }

        info!(
            trace_id = spec.trace_id,
            app_id = spec.app_id,
            release,
            "deployment succeeded"
        );
        Ok(())
    }

    /// The jail user must already exist; site activation creates it. A
    /// deployment for an unactivated site is a precondition failure, not
    /// an invitation to invent a UID.
    async fn require_jail_uid(&self, app_id: &str) -> Result<u32, AgentError> {
        let username = JailManager::username_for(app_id);
        match crate::host::jail::lookup_uid(&username).await? {
            Some(uid) => Ok(uid),
            None => Err(AgentError::Precondition(format!(
                "jail user {username} does not exist; activate the site first"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(tmp: &tempfile::TempDir) -> DeployEngine {
        DeployEngine::new(
            JailManager::new(tmp.path().join("apps")),
            ServiceManager::new(tmp.path().join("units")),
            tmp.path().join("apps"),
            2,
        )
    }

    fn spec(app_id: &str) -> DeploymentSpec {
        DeploymentSpec {
            trace_id: "dep-1".to_string(),
            app_id: app_id.to_string(),
            domain: "example.com".to_string(),
            repo_url: "https://example.com/repo.git".to_string(),
            branch: "main".to_string(),
            build_command: "true".to_string(),
            port: 3000,
            ssh_key: None,
        }
    }

    #[tokio::test]
    async fn invalid_app_id_is_rejected_without_eof() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(100);

        let result = engine(&tmp).run(spec("../escape"), tx).await;
        assert!(matches!(result, Err(AgentError::Rejected(_))));

        while let Some(chunk) = rx.recv().await {
            assert!(!chunk.is_eof, "failed deployment must not emit EOF");
        }
    }

    #[tokio::test]
    async fn missing_jail_user_is_a_precondition_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(100);

        let result = engine(&tmp).run(spec("nosuchapp12345"), tx).await;
        assert!(matches!(result, Err(AgentError::Precondition(_))));
    }
}
