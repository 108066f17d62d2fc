//! Request, response, and streaming message types.
//!
//! Field order is authoritative: both halves serialize with serde_json and
//! the enum tag (`op` / `result`) versions the schema. New operations are
//! added as new variants, never by reshaping existing ones.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Protocol revision carried in every request envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// One step of the site-activation pipeline, executed by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteActivationAction {
    CreateSystemUser,
    ApplyHttpVhost,
    IssueCertificate,
    ApplyHttpsVhost,
}

/// Requests accepted by the agent over the local socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AgentRequest {
    RunSystemCheck {
        server_id: String,
    },
    ActivateSite {
        site_id: String,
        domain: String,
        ipv4: Option<String>,
        ipv6: Option<String>,
        owner_uid: u32,
        action: SiteActivationAction,
    },
    PresentChallenge {
        domain: String,
        token: String,
        key_auth: String,
    },
    CleanupChallenge {
        domain: String,
        token: String,
    },
    InstallCertificate {
        domain: String,
        fullchain_pem: Vec<u8>,
        privkey_pem: Vec<u8>,
    },
    StreamDeployment {
        trace_id: String,
        app_id: String,
        domain: String,
        repo_url: String,
        branch: String,
        build_command: String,
        port: u16,
        ssh_key: Option<Vec<u8>>,
    },
    GetSystemStatus {},
}

/// Envelope for a single request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub version: u32,
    #[serde(flatten)]
    pub request: AgentRequest,
}

impl RequestEnvelope {
    pub fn new(request: AgentRequest) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request,
        }
    }
}

/// Host inventory returned from `RunSystemCheck`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemCheckReport {
    pub distro: String,
    pub version: String,
    /// Service name to status ("active", "inactive", "failed", ...).
    pub services: BTreeMap<String, String>,
    pub firewall_type: String,
    pub firewall_status: String,
}

/// Telemetry snapshot returned from `GetSystemStatus`, polled by the
/// brain's health prober.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub healthy: bool,
    pub distro: String,
    pub cpu_usage_percent: f32,
    pub memory_usage_mb: u64,
    pub active_jails: u32,
}

/// Origin of a log chunk within the deployment stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Stdout,
    Stderr,
    System,
}

/// One unit of build output. The message is passed through verbatim;
/// ANSI escape sequences survive to the browser terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    pub trace_id: String,
    pub level: LogLevel,
    pub message: String,
    /// Terminal marker: the agent sends exactly one chunk with this set
    /// after a deployment finishes, then closes the stream.
    pub is_eof: bool,
}

impl LogChunk {
    pub fn system(trace_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            level: LogLevel::System,
            message: message.into(),
            is_eof: false,
        }
    }

    pub fn eof(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            level: LogLevel::System,
            message: String::new(),
            is_eof: true,
        }
    }
}

/// Stable error classification carried across the socket.
///
/// The raw OS error stays inside the agent's logs; only the code and a
/// bounded human message cross the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorCode {
    Rejected,
    Precondition,
    ExecFailed,
    Integrity,
    Transient,
    Internal,
}

impl AgentErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentErrorCode::Rejected => "rejected",
            AgentErrorCode::Precondition => "precondition",
            AgentErrorCode::ExecFailed => "exec_failed",
            AgentErrorCode::Integrity => "integrity",
            AgentErrorCode::Transient => "transient",
            AgentErrorCode::Internal => "internal",
        }
    }
}

/// Classified error as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: AgentErrorCode,
    /// Bounded, operator-displayable message. Never raw OS error text.
    pub message: String,
}

/// Responses produced by the agent for unary requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AgentResponse {
    Ack {},
    SiteActivated { ok: bool },
    SystemCheck { report: SystemCheckReport },
    Status { status: SystemStatus },
    Error { error: WireError },
}

/// Frames sent on a `StreamDeployment` connection after the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stream", rename_all = "snake_case")]
pub enum StreamFrame {
    Chunk { chunk: LogChunk },
    Error { error: WireError },
}
