//! Domain models

mod actor;
mod deployment;
mod server;
mod site;

pub use actor::{Actor, Capability, CAP_APPLICATIONS_DEPLOY, CAP_SERVERS_ONBOARD};
pub use deployment::{Deployment, DeploymentStatus};
pub use server::Server;
pub use site::{CertificateMaterial, Site, SiteRecord};
