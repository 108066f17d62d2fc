//! Brain configuration from the environment

use std::env;

use crate::errors::PanelError;

/// Which agent implementation the brain talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentTransport {
    /// The real agent over the local socket.
    Socket,
    /// In-process fake returning canned success (dev and tests).
    InMemory,
}

#[derive(Debug, Clone)]
pub struct BrainConfig {
    /// HTTP bind address.
    pub http_address: String,

    pub agent_transport: AgentTransport,

    /// Socket path of the agent when the transport is `Socket`.
    pub agent_address: String,

    /// ACME directory URL; empty selects the in-memory certificate
    /// authority instead of a real ACME account.
    pub acme_directory_url: String,

    /// Contact address registered with the ACME account.
    pub acme_contact_email: String,
}

impl BrainConfig {
    pub fn load() -> Result<Self, PanelError> {
        let agent_transport = match string_var("AGENT_TRANSPORT", "inmemory").as_str() {
            // `grpc` is the historical name for the socket transport and
            // is still accepted in existing deployments.
            "socket" | "grpc" => AgentTransport::Socket,
            "inmemory" => AgentTransport::InMemory,
            other => {
                return Err(PanelError::Validation(format!(
                    "unknown AGENT_TRANSPORT: {other}"
                )))
            }
        };

        Ok(Self {
            http_address: string_var("HTTP_ADDRESS", ":8080"),
            agent_transport,
            agent_address: string_var("AGENT_ADDRESS", "/var/run/kari/agent.sock"),
            acme_directory_url: string_var("ACME_DIRECTORY_URL", ""),
            acme_contact_email: string_var("ACME_CONTACT_EMAIL", ""),
        })
    }

    /// The bind address in a form `TcpListener` accepts: a bare `:port`
    /// binds every interface.
    pub fn bind_address(&self) -> String {
        if let Some(port) = self.http_address.strip_prefix(':') {
            format!("0.0.0.0:{port}")
        } else {
            self.http_address.clone()
        }
    }
}

fn string_var(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_port_binds_all_interfaces() {
        let config = BrainConfig {
            http_address: ":8080".to_string(),
            agent_transport: AgentTransport::InMemory,
            agent_address: String::new(),
            acme_directory_url: String::new(),
            acme_contact_email: String::new(),
        };
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
    }
}
