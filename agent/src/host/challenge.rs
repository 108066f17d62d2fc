//! ACME HTTP-01 challenge files

use std::io::Write;
use std::path::PathBuf;

use nix::unistd::{chown, Gid, Group, Uid, User};
use tracing::info;

use crate::errors::AgentError;
use crate::host::validate_domain;

/// Writes and removes HTTP-01 response files under the web root.
#[derive(Clone, Debug)]
pub struct ChallengeManager {
    web_root: PathBuf,
    web_user: String,
    web_group: String,
}

impl ChallengeManager {
    pub fn new(web_root: PathBuf, web_user: String, web_group: String) -> Self {
        Self {
            web_root,
            web_user,
            web_group,
        }
    }

    fn challenge_path(&self, token: &str) -> PathBuf {
        self.web_root
            .join(".well-known")
            .join("acme-challenge")
            .join(token)
    }

    /// Write the key authorization for a challenge token.
    ///
    /// The token must match the ACME base64url alphabet exactly; anything
    /// else (slashes, dot-dot, whitespace) is rejected before a path is
    /// even constructed.
    pub async fn present(
        &self,
        domain: &str,
        token: &str,
        key_auth: &str,
    ) -> Result<(), AgentError> {
        validate_domain(domain)?;
        validate_token(token)?;

        let path = self.challenge_path(token);
        let key_auth = key_auth.to_string();
        let owner = resolve_web_owner(&self.web_user, &self.web_group)?;

        tokio::task::spawn_blocking(move || -> Result<(), AgentError> {
            use std::os::unix::fs::OpenOptionsExt;

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o644)
                .open(&path)?;
            file.write_all(key_auth.as_bytes())?;
            file.sync_all()?;

            if let Some((uid, gid)) = owner {
                chown(&path, Some(uid), Some(gid))
                    .map_err(|e| AgentError::Internal(format!("chown challenge file: {e}")))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| AgentError::Internal(format!("challenge task: {e}")))??;

        info!(domain, token, "presented ACME challenge");
        Ok(())
    }

    /// Remove exactly the file written by `present`. No globbing, no
    /// recursion; a missing file is a success.
    pub async fn cleanup(&self, domain: &str, token: &str) -> Result<(), AgentError> {
        validate_domain(domain)?;
        validate_token(token)?;

        let path = self.challenge_path(token);
        match tokio::fs::remove_file(&path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!(domain, token, "cleaned up ACME challenge");
        Ok(())
    }
}

/// Tokens come from the ACME server but are never trusted: only the
/// base64url alphabet is allowed, which excludes `/` and `..` by
/// construction.
pub fn validate_token(token: &str) -> Result<(), AgentError> {
    let ok = !token.is_empty()
        && token.len() <= 256
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !ok {
        return Err(AgentError::Rejected(format!(
            "invalid ACME challenge token: {token:?}"
        )));
    }
    Ok(())
}

/// Look up the configured web user/group for challenge-file ownership.
///
/// Only root can hand files to another owner, so an unprivileged process
/// (the test suite) leaves ownership alone. A root agent with a missing
/// web user is a host misconfiguration, not something to paper over.
fn resolve_web_owner(user: &str, group: &str) -> Result<Option<(Uid, Gid)>, AgentError> {
    if !nix::unistd::geteuid().is_root() {
        return Ok(None);
    }

    let uid = User::from_name(user)
        .map_err(|e| AgentError::Internal(format!("user lookup {user}: {e}")))?
        .ok_or_else(|| AgentError::Precondition(format!("web user {user} does not exist")))?
        .uid;
    let gid = Group::from_name(group)
        .map_err(|e| AgentError::Internal(format!("group lookup {group}: {e}")))?
        .ok_or_else(|| AgentError::Precondition(format!("web group {group} does not exist")))?
        .gid;
    Ok(Some((uid, gid)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(tmp: &tempfile::TempDir) -> ChallengeManager {
        ChallengeManager::new(
            tmp.path().to_path_buf(),
            "www-data".to_string(),
            "www-data".to_string(),
        )
    }

    #[tokio::test]
    async fn present_then_cleanup_restores_initial_state() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);

        mgr.present("example.com", "tok_abc-123", "tok.keyauth")
            .await
            .unwrap();

        let path = tmp
            .path()
            .join(".well-known/acme-challenge/tok_abc-123");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "tok.keyauth");

        mgr.cleanup("example.com", "tok_abc-123").await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn traversal_tokens_are_rejected_without_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);

        for token in ["../../../etc/passwd", "a/b", "..", "a b", ""] {
            let err = mgr
                .present("example.com", token, "key")
                .await
                .unwrap_err();
            assert!(matches!(err, AgentError::Rejected(_)), "token {token:?}");
        }

        // Nothing was created under the web root.
        assert!(!tmp.path().join(".well-known").exists());
    }

    #[test]
    fn token_charset_is_base64url_only() {
        assert!(validate_token("AbZ09_-").is_ok());
        assert!(validate_token("has.dot").is_err());
        assert!(validate_token("has/slash").is_err());
    }
}
