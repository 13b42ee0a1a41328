//! Configuration and paths

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// All configurable paths and intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub home: PathBuf,
    pub pid_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub queue_dir: PathBuf,
    pub data_dir: PathBuf,
    pub database: PathBuf,
    /// Binary the supervisor re-executes to spawn workers
    pub launcher: PathBuf,
    pub supervise_interval_ms: u64,
    pub idle_timeout_secs: u64,
    pub receive_timeout_ms: u64,
    pub read_interval_ms: u64,
    pub sender_interval_ms: u64,
    pub webhook_interval_ms: u64,
    pub webhook_timeout_secs: u64,
    pub webhook_batch: usize,
}

/// File name of the SQLite database inside `data_dir`
pub const DATABASE_FILE: &str = "smsgate.db";

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".smsgate");
        Self::with_home(home)
    }
}

impl Config {
    /// Create config for testing with custom paths
    pub fn for_test(temp_dir: &Path) -> Self {
        Self {
            home: temp_dir.to_path_buf(),
            pid_dir: temp_dir.join("pid"),
            logs_dir: temp_dir.join("logs"),
            queue_dir: temp_dir.join("queues"),
            data_dir: temp_dir.join("data"),
            database: temp_dir.join("smsgate.db"),
            launcher: PathBuf::from("/bin/true"),
            supervise_interval_ms: 0,
            idle_timeout_secs: 5 * 60,
            receive_timeout_ms: 10,
            read_interval_ms: 0,
            sender_interval_ms: 0,
            webhook_interval_ms: 0,
            webhook_timeout_secs: 2,
            webhook_batch: 50,
        }
    }

    /// Default settings with every path laid out under `home`
    pub fn with_home(home: PathBuf) -> Self {
        let launcher = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("smsgate"));
        let data_dir = home.join("data");

        Self {
            pid_dir: home.join("pid"),
            logs_dir: home.join("logs"),
            queue_dir: home.join("queues"),
            database: data_dir.join(DATABASE_FILE),
            data_dir,
            launcher,
            home,
            supervise_interval_ms: 1000,
            idle_timeout_secs: 5 * 60,
            receive_timeout_ms: 1000,
            read_interval_ms: 1000,
            sender_interval_ms: 1000,
            webhook_interval_ms: 1000,
            webhook_timeout_secs: 10,
            webhook_batch: 50,
        }
    }

    /// Load defaults, overlaid with a TOML file when one is given.
    ///
    /// Paths the file leaves out follow its `home`, and `database` follows
    /// `data_dir`. Relative paths are resolved against the current directory,
    /// since detached daemons run from `/`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                let table: toml::Table = toml::from_str(&content)?;
                let mut config: Config = toml::Value::Table(table.clone()).try_into()?;
                config.derive_unset_paths(&table);
                config
            }
            None => Self::default(),
        };
        config.resolve_relative_paths(&std::env::current_dir()?);
        Ok(config)
    }

    fn derive_unset_paths(&mut self, table: &toml::Table) {
        let unset = |key: &str| !table.contains_key(key);
        if unset("pid_dir") {
            self.pid_dir = self.home.join("pid");
        }
        if unset("logs_dir") {
            self.logs_dir = self.home.join("logs");
        }
        if unset("queue_dir") {
            self.queue_dir = self.home.join("queues");
        }
        if unset("data_dir") {
            self.data_dir = self.home.join("data");
        }
        if unset("database") {
            self.database = self.data_dir.join(DATABASE_FILE);
        }
    }

    fn resolve_relative_paths(&mut self, cwd: &Path) {
        for path in [
            &mut self.home,
            &mut self.pid_dir,
            &mut self.logs_dir,
            &mut self.queue_dir,
            &mut self.data_dir,
            &mut self.database,
        ] {
            if path.is_relative() {
                *path = cwd.join(&*path);
            }
        }
    }

    pub fn log_file(&self) -> PathBuf {
        self.logs_dir.join("smsgate.log")
    }

    pub fn supervise_interval(&self) -> Duration {
        Duration::from_millis(self.supervise_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn read_interval(&self) -> Duration {
        Duration::from_millis(self.read_interval_ms)
    }

    pub fn sender_interval(&self) -> Duration {
        Duration::from_millis(self.sender_interval_ms)
    }

    pub fn webhook_interval(&self) -> Duration {
        Duration::from_millis(self.webhook_interval_ms)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}

/// Daemon names, which double as pid-file stems
pub const MANAGER_NAME: &str = "manager";
pub const SENDER_NAME: &str = "sender";
pub const WEBHOOK_NAME: &str = "webhook";

/// Pid-file stem of the worker owning `number`
pub fn phone_daemon_name(number: &str) -> String {
    format!("phone-{}", number)
}
