//! System alerts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// One classified alert. The message is the operator-facing form; raw
/// error detail lives only in structured logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub source: String,
    pub subject: String,
    pub category: String,
    pub severity: Severity,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn critical(
        source: impl Into<String>,
        subject: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            subject: subject.into(),
            category: kind.as_str().to_string(),
            severity: Severity::Critical,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}
