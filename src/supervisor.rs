//! Supervisor: keeps one process alive per expected worker
//!
//! Each pass lists the workers that should exist (sender, webhook and one per
//! configured phone) and launches every one whose pid-file is missing.

use crate::config::{phone_daemon_name, Config, MANAGER_NAME, SENDER_NAME, WEBHOOK_NAME};
use crate::daemon::{Control, Daemon, DaemonSpec};
use crate::error::Result;
use crate::pidfile::PidFile;
use crate::store::Store;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// A worker the supervisor is responsible for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerKind {
    Sender,
    Webhook,
    Phone { id: i64, number: String },
}

impl WorkerKind {
    /// Daemon name, which is also the pid-file stem
    pub fn daemon_name(&self) -> String {
        match self {
            WorkerKind::Sender => SENDER_NAME.to_string(),
            WorkerKind::Webhook => WEBHOOK_NAME.to_string(),
            WorkerKind::Phone { number, .. } => phone_daemon_name(number),
        }
    }

    /// Command line arguments selecting this worker
    pub fn args(&self) -> Vec<String> {
        match self {
            WorkerKind::Sender => vec!["sender".to_string()],
            WorkerKind::Webhook => vec!["webhook".to_string()],
            WorkerKind::Phone { id, .. } => vec!["phone".to_string(), format!("--id_phone={}", id)],
        }
    }
}

/// Every worker that should be running for the current phone set
pub fn expected_workers(store: &Store) -> Result<Vec<WorkerKind>> {
    let mut workers = vec![WorkerKind::Sender, WorkerKind::Webhook];
    workers.extend(store.phones()?.into_iter().map(|phone| WorkerKind::Phone {
        id: phone.id,
        number: phone.number,
    }));
    Ok(workers)
}

/// Starts a worker as an independent process
pub trait Launcher {
    fn launch(&mut self, worker: &WorkerKind) -> Result<()>;
}

/// Re-executes the smsgate binary in the worker's mode
pub struct CommandLauncher {
    program: PathBuf,
    config_file: Option<PathBuf>,
}

impl CommandLauncher {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            config_file: None,
        }
    }

    /// Forward `--config <path>` to every launched worker
    pub fn with_config_file(mut self, path: Option<PathBuf>) -> Self {
        self.config_file = path;
        self
    }
}

impl Launcher for CommandLauncher {
    fn launch(&mut self, worker: &WorkerKind) -> Result<()> {
        let mut command = Command::new(&self.program);
        if let Some(path) = &self.config_file {
            command.arg("--config").arg(path);
        }
        let child = command
            .args(worker.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        // The launcher process forks the worker and exits; SIGCHLD reaps it
        debug!(pid = child.id(), worker = %worker.daemon_name(), "Launcher spawned");
        Ok(())
    }
}

pub struct Supervisor<L: Launcher> {
    config: Config,
    launcher: L,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(config: &Config, launcher: L) -> Self {
        Self {
            config: config.clone(),
            launcher,
        }
    }

    pub fn spec(&self) -> DaemonSpec {
        DaemonSpec::new(MANAGER_NAME, &self.config.pid_dir).unique()
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// One supervision pass. Returns how many workers were launched.
    pub fn supervise_once(&mut self) -> Result<usize> {
        let store = Store::open(&self.config.database)?;
        let mut launched = 0;

        for worker in expected_workers(&store)? {
            let name = worker.daemon_name();
            let pid_file = PidFile::new(&self.config.pid_dir, &name);
            pid_file.clear_stale()?;
            if pid_file.exists() {
                continue;
            }

            match self.launcher.launch(&worker) {
                Ok(()) => {
                    info!(worker = %name, "Launched missing worker");
                    launched += 1;
                }
                Err(e) => warn!(worker = %name, "Failed to launch worker: {}", e),
            }
        }
        Ok(launched)
    }
}

impl<L: Launcher> Daemon for Supervisor<L> {
    fn on_start(&mut self) -> Result<()> {
        info!(pid_dir = %self.config.pid_dir.display(), "Supervisor started");
        Ok(())
    }

    fn run(&mut self, _control: &Control) -> Result<()> {
        self.supervise_once()?;
        std::thread::sleep(self.config.supervise_interval());
        Ok(())
    }

    fn on_stop(&mut self) -> Result<()> {
        info!("Supervisor stopped");
        Ok(())
    }
}
