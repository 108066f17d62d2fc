//! Error types for the Kari brain

use kari_proto::{AgentErrorCode, WireError};
use thiserror::Error;

/// Stable classification of a panel error, queryable without string
/// matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Unauthorized,
    Precondition,
    ExecutionFailed,
    Integrity,
    Transient,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Precondition => "precondition",
            ErrorKind::ExecutionFailed => "exec",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Transient => "transient",
            ErrorKind::Internal => "internal",
        }
    }

    /// Category tag shown in the deployment terminal, e.g. `[EXEC]`.
    pub fn tag(self) -> String {
        format!("[{}]", self.as_str().to_uppercase())
    }
}

/// Main error type for the Kari brain.
#[derive(Error, Debug)]
pub enum PanelError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PanelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PanelError::Validation(_) => ErrorKind::Validation,
            PanelError::Unauthorized(_) => ErrorKind::Unauthorized,
            PanelError::Precondition(_) => ErrorKind::Precondition,
            PanelError::ExecutionFailed(_) => ErrorKind::ExecutionFailed,
            PanelError::Integrity(_) => ErrorKind::Integrity,
            PanelError::Transient(_) => ErrorKind::Transient,
            PanelError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Operator-facing message: classified, never raw. The full error is
    /// kept for structured logs only.
    pub fn operator_message(&self) -> String {
        match self {
            PanelError::Validation(msg) => msg.clone(),
            PanelError::Internal(_) => "internal error".to_string(),
            other => format!("{} {}", other.kind().tag(), classified_detail(other)),
        }
    }
}

fn classified_detail(err: &PanelError) -> String {
    match err {
        PanelError::Unauthorized(m)
        | PanelError::Precondition(m)
        | PanelError::ExecutionFailed(m)
        | PanelError::Integrity(m)
        | PanelError::Transient(m) => m.clone(),
        PanelError::Validation(m) => m.clone(),
        PanelError::Internal(_) => "internal error".to_string(),
    }
}

/// Classified agent errors map straight onto the panel taxonomy; the
/// agent already stripped raw OS detail before the message crossed the
/// socket.
impl From<WireError> for PanelError {
    fn from(wire: WireError) -> Self {
        match wire.code {
            AgentErrorCode::Rejected => PanelError::Validation(wire.message),
            AgentErrorCode::Precondition => PanelError::Precondition(wire.message),
            AgentErrorCode::ExecFailed => PanelError::ExecutionFailed(wire.message),
            AgentErrorCode::Integrity => PanelError::Integrity(wire.message),
            AgentErrorCode::Transient => PanelError::Transient(wire.message),
            AgentErrorCode::Internal => PanelError::Internal(wire.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_queryable_without_string_matching() {
        assert_eq!(
            PanelError::Validation("x".into()).kind(),
            ErrorKind::Validation
        );
        assert!(PanelError::Transient("x".into()).is_transient());
        assert!(!PanelError::Internal("x".into()).is_transient());
    }

    #[test]
    fn internal_detail_never_reaches_operators() {
        let err = PanelError::Internal("pq: connection refused at 10.0.0.5".into());
        assert_eq!(err.operator_message(), "internal error");
    }

    #[test]
    fn terminal_tags_match_taxonomy() {
        assert_eq!(ErrorKind::ExecutionFailed.tag(), "[EXEC]");
        assert_eq!(ErrorKind::Integrity.tag(), "[INTEGRITY]");
    }

    #[test]
    fn wire_errors_map_onto_the_taxonomy() {
        let wire = WireError {
            code: AgentErrorCode::ExecFailed,
            message: "git exited with code 128".into(),
        };
        let err: PanelError = wire.into();
        assert_eq!(err.kind(), ErrorKind::ExecutionFailed);
    }
}
