//! Error types for the Kari agent

use kari_proto::{AgentErrorCode, WireError};
use thiserror::Error;

/// Longest message the agent will put on the wire or in a log chunk.
const MAX_WIRE_MESSAGE: usize = 300;

/// Main error type for the Kari agent.
///
/// Variants mirror the panel-wide error taxonomy. Raw OS error text stays
/// in this process's logs; only [`AgentError::to_wire`] output crosses the
/// socket.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Invalid input or a policy violation. Nothing was executed.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Host state does not permit the intent.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A spawned child process returned non-zero.
    #[error("{program} exited with code {code}")]
    ExecFailed {
        program: String,
        code: i32,
        stderr_tail: String,
    },

    /// A generated artifact failed its offline validation.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Retriable condition (lock contention, temporary filesystem error).
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Stable classification code, queryable without string matching.
    pub fn code(&self) -> AgentErrorCode {
        match self {
            AgentError::Rejected(_) => AgentErrorCode::Rejected,
            AgentError::Precondition(_) => AgentErrorCode::Precondition,
            AgentError::ExecFailed { .. } => AgentErrorCode::ExecFailed,
            AgentError::Integrity(_) => AgentErrorCode::Integrity,
            AgentError::Transient(_) => AgentErrorCode::Transient,
            AgentError::Io(_) | AgentError::Internal(_) => AgentErrorCode::Internal,
        }
    }

    /// Classified form suitable for the wire: a stable code plus a bounded
    /// operator message. Internal errors are collapsed to a generic message
    /// so OS detail (paths, embedded credentials) cannot leak to the brain.
    pub fn to_wire(&self) -> WireError {
        let message = match self {
            AgentError::Io(_) | AgentError::Internal(_) => "internal agent error".to_string(),
            AgentError::ExecFailed {
                program,
                code,
                stderr_tail,
            } => truncate(&format!("{program} exited with code {code}: {stderr_tail}")),
            other => truncate(&other.to_string()),
        };

        WireError {
            code: self.code(),
            message,
        }
    }
}

fn truncate(message: &str) -> String {
    if message.len() <= MAX_WIRE_MESSAGE {
        return message.to_string();
    }
    let mut end = MAX_WIRE_MESSAGE;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_never_leak_detail() {
        let err = AgentError::Internal("open /etc/kari/ssl: permission denied".to_string());
        let wire = err.to_wire();
        assert_eq!(wire.code, AgentErrorCode::Internal);
        assert_eq!(wire.message, "internal agent error");
    }

    #[test]
    fn exec_failures_carry_code_and_bounded_tail() {
        let err = AgentError::ExecFailed {
            program: "git".to_string(),
            code: 128,
            stderr_tail: "fatal: repository not found".to_string(),
        };
        let wire = err.to_wire();
        assert_eq!(wire.code, AgentErrorCode::ExecFailed);
        assert!(wire.message.contains("128"));
        assert!(wire.message.contains("repository not found"));
    }

    #[test]
    fn long_messages_are_truncated() {
        let err = AgentError::Rejected("x".repeat(2000));
        assert!(err.to_wire().message.len() <= MAX_WIRE_MESSAGE + 3);
    }
}
