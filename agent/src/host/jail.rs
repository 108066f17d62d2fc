//! Application jailing
//!
//! One unprivileged Linux user per application, no login shell, no
//! supplementary groups. Directories under the application root are
//! created with mode 0750 at creation, never widened afterwards.

use std::path::{Path, PathBuf};

use nix::unistd::{chown, Gid, Uid};
use tracing::info;

use crate::errors::AgentError;
use crate::host::{exec, validate_username};

/// Manages per-application system users and their directory trees.
#[derive(Clone, Debug)]
pub struct JailManager {
    app_root: PathBuf,
}

impl JailManager {
    pub fn new(app_root: PathBuf) -> Self {
        Self { app_root }
    }

    /// The jail user name for an application.
    pub fn username_for(app_id: &str) -> String {
        format!("kari-app-{app_id}")
    }

    /// Home directory of an application jail.
    pub fn home_for(&self, app_id: &str) -> PathBuf {
        self.app_root.join(app_id)
    }

    /// Create the application user with the requested UID.
    ///
    /// Idempotent: an existing user with the same UID is a success; an
    /// existing user with a different UID is a precondition failure, since
    /// release trees on disk would be owned by somebody else.
    pub async fn provision_user(&self, app_id: &str, uid: u32) -> Result<(), AgentError> {
        let username = Self::username_for(app_id);
        validate_username(&username)?;

        if let Some(existing) = lookup_uid(&username).await? {
            if existing != uid {
                return Err(AgentError::Precondition(format!(
                    "user {username} exists with uid {existing}, expected {uid}"
                )));
            }
            return Ok(());
        }

        let home = self.home_for(app_id);
        let uid_arg = uid.to_string();
        let home_arg = home.to_string_lossy().to_string();

        exec::run_checked(
            "useradd",
            &[
                "--system",
                "--shell",
                "/bin/false",
                "--uid",
                &uid_arg,
                "--user-group",
                "--home-dir",
                &home_arg,
                "--create-home",
                &username,
            ],
        )
        .await?;

        info!(username, uid, "provisioned application jail user");
        Ok(())
    }

    /// Create a directory (and missing parents) with mode 0750 at creation
    /// and hand it to the jail user.
    pub async fn secure_dir(&self, path: &Path, uid: u32) -> Result<(), AgentError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<(), AgentError> {
            use std::os::unix::fs::DirBuilderExt;

            if !path.exists() {
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o750)
                    .create(&path)?;
            }
            chown(&path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(uid)))
                .map_err(|e| AgentError::Internal(format!("chown {}: {e}", path.display())))?;
            Ok(())
        })
        .await
        .map_err(|e| AgentError::Internal(format!("secure_dir task: {e}")))?
    }

    /// Recursively hand an existing tree to the jail user. Used after a
    /// clone, which creates files as root.
    pub async fn own_tree(&self, path: &Path, uid: u32) -> Result<(), AgentError> {
        let spec = format!("{uid}:{uid}");
        let path_arg = path.to_string_lossy().to_string();
        exec::run_checked("chown", &["-R", &spec, &path_arg]).await?;
        Ok(())
    }

    /// Number of provisioned jails, counted as application directories.
    pub async fn jail_count(&self) -> u32 {
        let mut count = 0;
        if let Ok(mut entries) = tokio::fs::read_dir(&self.app_root).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    count += 1;
                }
            }
        }
        count
    }
}

/// Resolve a username to its UID, or `None` if the user does not exist.
pub(crate) async fn lookup_uid(username: &str) -> Result<Option<u32>, AgentError> {
    let output = exec::run("id", &["-u", username]).await?;
    if !output.success() {
        return Ok(None);
    }
    let uid = output
        .stdout
        .trim()
        .parse::<u32>()
        .map_err(|_| AgentError::Internal(format!("unparseable uid for {username}")))?;
    Ok(Some(uid))
}
