//! Health checking for worker processes
//!
//! A worker is healthy when its pid-file exists and names a live process.

use crate::config::{Config, MANAGER_NAME};
use crate::error::Result;
use crate::pidfile::{PidFile, PidStatus};
use crate::store::Store;
use crate::supervisor::expected_workers;
use std::path::Path;

/// Result of a health check
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy(UnhealthyReason),
}

/// Reason for unhealthy status
#[derive(Debug, Clone, PartialEq)]
pub enum UnhealthyReason {
    PidFileMissing,
    ProcessDead(u32),
}

impl std::fmt::Display for UnhealthyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnhealthyReason::PidFileMissing => write!(f, "pid_file_missing"),
            UnhealthyReason::ProcessDead(pid) => write!(f, "process_dead:{}", pid),
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy(reason) => write!(f, "unhealthy ({})", reason),
        }
    }
}

/// Check one daemon by name
pub fn check_worker(pid_dir: &Path, name: &str) -> HealthStatus {
    match PidFile::new(pid_dir, name).status() {
        PidStatus::Live(_) => HealthStatus::Healthy,
        PidStatus::Absent => HealthStatus::Unhealthy(UnhealthyReason::PidFileMissing),
        PidStatus::Stale(pid) => HealthStatus::Unhealthy(UnhealthyReason::ProcessDead(pid)),
    }
}

/// Health of the supervisor and of every worker it should be running
pub fn check_all(config: &Config, store: &Store) -> Result<Vec<(String, HealthStatus)>> {
    let mut names = vec![MANAGER_NAME.to_string()];
    names.extend(expected_workers(store)?.iter().map(|w| w.daemon_name()));

    Ok(names
        .into_iter()
        .map(|name| {
            let status = check_worker(&config.pid_dir, &name);
            (name, status)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_pid_file() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(
            check_worker(temp_dir.path(), "sender"),
            HealthStatus::Unhealthy(UnhealthyReason::PidFileMissing)
        );
    }

    #[test]
    fn test_live_process_is_healthy() {
        let temp_dir = TempDir::new().unwrap();
        PidFile::new(temp_dir.path(), "sender")
            .claim(std::process::id())
            .unwrap();
        assert_eq!(check_worker(temp_dir.path(), "sender"), HealthStatus::Healthy);
    }

    #[test]
    fn test_dead_process() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("webhook.pid"), "999999999").unwrap();
        let status = check_worker(temp_dir.path(), "webhook");
        assert_eq!(
            status,
            HealthStatus::Unhealthy(UnhealthyReason::ProcessDead(999_999_999))
        );
        assert_eq!(status.to_string(), "unhealthy (process_dead:999999999)");
    }

    #[test]
    fn test_check_all_covers_expected_workers() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::for_test(temp_dir.path());
        let store = Store::open_in_memory().unwrap();
        store.insert_phone("+33612345678", "test", "{}").unwrap();
        std::fs::create_dir_all(&config.pid_dir).unwrap();
        PidFile::new(&config.pid_dir, "manager")
            .claim(std::process::id())
            .unwrap();

        let report = check_all(&config, &store).unwrap();
        let names: Vec<&str> = report.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["manager", "sender", "webhook", "phone-+33612345678"]);
        assert_eq!(report[0].1, HealthStatus::Healthy);
        assert!(matches!(report[3].1, HealthStatus::Unhealthy(_)));
    }
}
