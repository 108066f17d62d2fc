//! Servers being onboarded

use serde::{Deserialize, Serialize};

use crate::errors::PanelError;

/// A host being onboarded into the panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub address: String,
}

impl Server {
    pub fn validate(&self) -> Result<(), PanelError> {
        if self.id.trim().is_empty() {
            return Err(PanelError::Validation("server id is required".to_string()));
        }
        if self.address.trim().is_empty() {
            return Err(PanelError::Validation(
                "server address is required".to_string(),
            ));
        }
        Ok(())
    }
}
