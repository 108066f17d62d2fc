//! Telemetry snapshot for the brain's health prober

use kari_proto::SystemStatus;
use sysinfo::{Pid, System};

/// Collect the agent's telemetry snapshot.
///
/// `active_jails` is supplied by the caller (the jail manager counts its
/// application directories) so this module stays free of filesystem
/// layout knowledge.
pub fn collect_status(active_jails: u32) -> SystemStatus {
    let mut sys = System::new_all();
    sys.refresh_all();

    let memory_usage_mb = sysinfo::get_current_pid()
        .ok()
        .and_then(|pid: Pid| sys.process(pid).map(|p| p.memory() / (1024 * 1024)))
        .unwrap_or(0);

    SystemStatus {
        healthy: true,
        distro: System::distribution_id(),
        cpu_usage_percent: sys.global_cpu_usage(),
        memory_usage_mb,
        active_jails,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_healthy_with_jail_count() {
        let status = collect_status(3);
        assert!(status.healthy);
        assert_eq!(status.active_jails, 3);
        assert!(!status.distro.is_empty());
    }
}
