//! Hardened service-unit generation

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use tracing::info;

use crate::errors::AgentError;
use crate::host::exec;

/// Inputs for one generated application service unit.
#[derive(Debug, Clone)]
pub struct ServiceUnit {
    pub service_name: String,
    pub username: String,
    pub working_directory: String,
    /// Discrete argv for ExecStart; quoted per systemd rules at render time.
    pub exec_start: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
}

impl ServiceUnit {
    /// Render the unit file contents.
    ///
    /// Environment values are stripped of newlines and have inner quotes
    /// escaped so a value cannot break out of its `Environment=""` boundary
    /// and smuggle in extra directives.
    pub fn render(&self) -> String {
        let mut env_block = String::new();
        for (k, v) in &self.env_vars {
            let safe_k = k.replace('\n', "");
            let safe_v = v.replace('\n', "").replace('"', "\\\"");
            env_block.push_str(&format!("Environment=\"{safe_k}={safe_v}\"\n"));
        }

        let mut exec_start = String::new();
        for (i, arg) in self.exec_start.iter().enumerate() {
            if i > 0 {
                exec_start.push(' ');
            }
            let safe_arg = arg.replace('\n', "").replace('"', "\\\"");
            if i == 0 {
                exec_start.push_str(&safe_arg);
            } else {
                exec_start.push_str(&format!("\"{safe_arg}\""));
            }
        }

        format!(
            r#"[Unit]
Description=Kari managed app: {service_name}
After=network.target

[Service]
Type=simple
User={username}
Group={username}
WorkingDirectory={workdir}
ExecStart={exec_start}
{env_block}Restart=always
RestartSec=3

CPUAccounting=true
MemoryAccounting=true
MemoryMax=512M
TasksMax=512

NoNewPrivileges=true
ProtectSystem=strict
ReadWritePaths={workdir}
PrivateTmp=true
PrivateDevices=true
ProtectHome=true
ProtectKernelTunables=true
ProtectKernelModules=true
ProtectControlGroups=true
RestrictAddressFamilies=AF_INET AF_INET6 AF_UNIX

[Install]
WantedBy=multi-user.target
"#,
            service_name = self.service_name,
            username = self.username,
            workdir = self.working_directory,
            exec_start = exec_start,
            env_block = env_block,
        )
    }
}

/// Writes unit descriptors and drives systemd.
#[derive(Clone, Debug)]
pub struct ServiceManager {
    services_root: PathBuf,
}

impl ServiceManager {
    pub fn new(services_root: PathBuf) -> Self {
        Self { services_root }
    }

    /// The service name for an application.
    pub fn service_name_for(app_id: &str) -> String {
        format!("kari-{app_id}")
    }

    /// Write the unit file with mode 0644 applied at creation.
    pub async fn install_unit(&self, unit: &ServiceUnit) -> Result<(), AgentError> {
        let path = self.services_root.join(format!("{}.service", unit.service_name));
        let contents = unit.render();

        tokio::task::spawn_blocking(move || -> Result<(), AgentError> {
            use std::os::unix::fs::OpenOptionsExt;

            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o644)
                .open(&path)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
            Ok(())
        })
        .await
        .map_err(|e| AgentError::Internal(format!("install_unit task: {e}")))??;

        info!(service = %unit.service_name, "installed service unit");
        Ok(())
    }

    pub async fn daemon_reload(&self) -> Result<(), AgentError> {
        exec::run_checked("systemctl", &["daemon-reload"]).await?;
        Ok(())
    }

    pub async fn enable_and_restart(&self, service_name: &str) -> Result<(), AgentError> {
        exec::run_checked("systemctl", &["enable", service_name]).await?;
        exec::run_checked("systemctl", &["restart", service_name]).await?;
        Ok(())
    }

    pub async fn reload(&self, service_name: &str) -> Result<(), AgentError> {
        exec::run_checked("systemctl", &["reload", service_name]).await?;
        Ok(())
    }
}
