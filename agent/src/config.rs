//! Agent configuration from the environment

use std::env;
use std::path::PathBuf;

use crate::errors::AgentError;

/// Agent configuration.
///
/// `EXPECTED_BRAIN_UID` has no default: an agent that does not know which
/// peer to accept must refuse to start rather than guess.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Path of the local RPC socket.
    pub socket_path: PathBuf,

    /// The only peer UID allowed past accept().
    pub expected_brain_uid: u32,

    /// Group that receives 0660 access to the socket (the brain's group).
    pub socket_group: String,

    /// Document root used for ACME HTTP-01 challenge files.
    pub web_root: PathBuf,

    /// Ownership applied to challenge files.
    pub web_user: String,
    pub web_group: String,

    /// Base path for per-domain certificate directories.
    pub cert_root: PathBuf,

    /// Directory for generated service-unit descriptors.
    pub services_root: PathBuf,

    /// Base path for per-application release trees.
    pub app_root: PathBuf,

    /// Directory the reverse proxy loads vhost files from.
    pub sites_root: PathBuf,

    /// How many releases to keep per application when pruning.
    pub releases_per_app_keep: usize,
}

impl AgentConfig {
    pub fn load() -> Result<Self, AgentError> {
        let expected_brain_uid = env::var("EXPECTED_BRAIN_UID")
            .map_err(|_| AgentError::Rejected("EXPECTED_BRAIN_UID is not set".to_string()))?
            .parse::<u32>()
            .map_err(|_| AgentError::Rejected("EXPECTED_BRAIN_UID is not an integer".to_string()))?;

        let releases_per_app_keep = match env::var("RELEASES_PER_APP_KEEP") {
            Ok(raw) => raw.parse::<usize>().map_err(|_| {
                AgentError::Rejected("RELEASES_PER_APP_KEEP is not an integer".to_string())
            })?,
            Err(_) => 5,
        };

        Ok(Self {
            socket_path: path_var("AGENT_ADDRESS", "/var/run/kari/agent.sock"),
            expected_brain_uid,
            socket_group: string_var("SOCKET_GROUP", "kari"),
            web_root: path_var("WEB_ROOT", "/var/www"),
            web_user: string_var("WEB_USER", "www-data"),
            web_group: string_var("WEB_GROUP", "www-data"),
            cert_root: path_var("CERT_ROOT", "/etc/kari/ssl"),
            services_root: path_var("SERVICES_ROOT", "/etc/systemd/system"),
            app_root: path_var("APP_ROOT", "/srv/kari/apps"),
            sites_root: path_var("NGINX_SITES_DIR", "/etc/nginx/sites-enabled"),
            releases_per_app_keep,
        })
    }
}

fn string_var(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn path_var(name: &str, default: &str) -> PathBuf {
    PathBuf::from(string_var(name, default))
}
