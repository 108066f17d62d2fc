//! Release trees and symlink-aware pruning
//!
//! Every deployment lands in `<app>/releases/<YYYYMMDDhhmmss>`. The
//! `current` symlink moves with an atomic rename of a staged link, and
//! pruning always spares the release `current` resolves to, even when a
//! rollback has pinned it far in the past.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::errors::AgentError;

/// Directory name of a release created at `now`.
pub fn release_name(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

/// Exact 14-digit timestamp check; anything else in the releases dir is
/// not ours to manage.
pub fn is_release_name(name: &str) -> bool {
    name.len() == 14 && name.chars().all(|c| c.is_ascii_digit())
}

/// Path helpers for one application's tree.
#[derive(Clone, Debug)]
pub struct AppTree {
    app_dir: PathBuf,
}

impl AppTree {
    pub fn new(app_dir: PathBuf) -> Self {
        Self { app_dir }
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.app_dir.join("releases")
    }

    pub fn release_dir(&self, name: &str) -> PathBuf {
        self.releases_dir().join(name)
    }

    pub fn current_link(&self) -> PathBuf {
        self.app_dir.join("current")
    }

    /// Point `current` at a release with a staged symlink plus rename.
    /// Readers on the same filesystem only ever see the old or the new
    /// target, never a missing link.
    pub async fn activate_release(&self, name: &str) -> Result<(), AgentError> {
        let target = self.release_dir(name);
        if !target.is_dir() {
            return Err(AgentError::Precondition(format!(
                "release {name} does not exist"
            )));
        }

        let staged = self.app_dir.join(".current.staged");
        let _ = tokio::fs::remove_file(&staged).await;
        tokio::fs::symlink(&target, &staged).await?;
        tokio::fs::rename(&staged, self.current_link()).await?;

        info!(release = name, "activated release");
        Ok(())
    }

    /// The release `current` resolves to, by directory name.
    pub async fn current_release(&self) -> Result<Option<String>, AgentError> {
        match tokio::fs::read_link(self.current_link()).await {
            Ok(target) => Ok(release_name_of(&target)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete old releases, keeping the `keep` most recent and,
    /// unconditionally, the target of `current`. Returns the names of the
    /// deleted releases.
    pub async fn prune_releases(&self, keep: usize) -> Result<Vec<String>, AgentError> {
        let releases_dir = self.releases_dir();
        if !releases_dir.is_dir() {
            return Ok(Vec::new());
        }

        let pinned = self.current_release().await?;

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&releases_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_release_name(&name) && entry.file_type().await?.is_dir() {
                names.push(name);
            }
        }

        // Lexicographic descending is chronological descending for the
        // fixed-width timestamp format.
        names.sort_unstable_by(|a, b| b.cmp(a));

        let mut deleted = Vec::new();
        for name in names.iter().skip(keep) {
            if Some(name.as_str()) == pinned.as_deref() {
                continue;
            }
            let path = self.release_dir(name);
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                warn!(release = %name, error = %e, "failed to delete old release");
            } else {
                deleted.push(name.clone());
            }
        }

        if !deleted.is_empty() {
            info!(count = deleted.len(), "pruned old releases");
        }
        Ok(deleted)
    }
}

fn release_name_of(target: &Path) -> Option<String> {
    let name = target.file_name()?.to_string_lossy().to_string();
    is_release_name(&name).then_some(name)
}
