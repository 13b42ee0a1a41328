//! Pid-files: `<pid_dir>/<name>.pid` holding a plain-text process id
//!
//! Presence of the file is what marks a daemon as running. Claiming uses an
//! exclusive create so two racing starts cannot both own the same name.

use crate::error::Result;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// What a pid-file says about its daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidStatus {
    Absent,
    Live(Option<u32>),
    /// The file names a process that no longer exists
    Stale(u32),
}

#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(pid_dir: &Path, name: &str) -> Self {
        Self {
            path: pid_dir.join(format!("{}.pid", name)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the recorded pid, `None` if the file is absent or unparsable
    pub fn read_pid(&self) -> Option<u32> {
        let content = fs::read_to_string(&self.path).ok()?;
        content.trim().parse().ok()
    }

    /// Classify the pid-file. Unparsable content counts as live.
    pub fn status(&self) -> PidStatus {
        if !self.exists() {
            return PidStatus::Absent;
        }

        let pid = match self.read_pid() {
            Some(pid) => pid,
            None => return PidStatus::Live(None),
        };

        match i32::try_from(pid) {
            Ok(raw) if raw > 0 => match kill(Pid::from_raw(raw), None) {
                Err(Errno::ESRCH) => PidStatus::Stale(pid),
                _ => PidStatus::Live(Some(pid)),
            },
            _ => PidStatus::Live(Some(pid)),
        }
    }

    /// Atomically create the file and write `pid` into it.
    ///
    /// Fails with `ErrorKind::AlreadyExists` when another process holds it.
    pub fn claim(&self, pid: u32) -> io::Result<()> {
        let mut file = open_new(&self.path)?;
        write!(file, "{}", pid)?;
        file.sync_all()?;
        Ok(())
    }

    /// Remove the file, ignoring a file that is already gone
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the file if it points at a dead process. Returns true if removed.
    pub fn clear_stale(&self) -> Result<bool> {
        match self.status() {
            PidStatus::Stale(pid) => {
                tracing::warn!(path = %self.path.display(), pid, "Removing stale pid file");
                self.remove()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn open_new(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(path)
}
