//! Kari System Agent Library
//!
//! The agent is the root-privileged half of the panel ("the Muscle"). It
//! listens on a local socket, verifies every peer's UID against the
//! configured brain UID, and executes typed intents against the host:
//! user jails, vhost configs, certificates, ACME challenge files, and
//! streaming git deployments.

#[cfg(not(unix))]
compile_error!("kari-agent requires kernel peer credentials (SO_PEERCRED) and will not build elsewhere");

pub mod config;
pub mod deploy;
pub mod errors;
pub mod host;
pub mod logs;
pub mod rpc;
pub mod secrets;
pub mod telemetry;
