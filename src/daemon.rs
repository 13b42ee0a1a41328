//! Daemon lifecycle
//!
//! A [`Lifecycle`] turns any [`Daemon`] into a supervised background process:
//! fork and detach, claim `<pid_dir>/<name>.pid`, call `on_start`, drive `run`
//! until asked to stop, then `on_stop` and drop the pid-file.
//!
//! Signals are polled at the top of every loop iteration, so a stop request
//! never interrupts a `run` call in flight:
//!
//! | signal      | effect                                   |
//! |-------------|------------------------------------------|
//! | TERM, INT   | leave the loop after the current `run`   |
//! | HUP         | `on_stop` then `on_start`, keep running  |
//! | CHLD        | reap finished children without blocking  |
//! | anything else registered | `handle_other_signal`       |

use crate::error::{Error, Result};
use crate::pidfile::{PidFile, PidStatus};
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, close, dup2, fork, setsid, ForkResult, Pid};
use signal_hook::consts::{SIGCHLD, SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::any::Any;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};

pub const EXIT_DETACH_FAILED: i32 = 1;
pub const EXIT_PID_DIR_FAILED: i32 = 2;
pub const EXIT_PID_FILE_FAILED: i32 = 3;
pub const EXIT_START_FAILED: i32 = 4;
pub const EXIT_SIGNALS_FAILED: i32 = 5;

/// Signals every daemon observes
pub const BASE_SIGNALS: [i32; 4] = [SIGTERM, SIGINT, SIGCHLD, SIGHUP];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Initializing,
    Running,
    Stopping,
    Terminated,
}

/// Result of [`Lifecycle::start`] as seen by the launching process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Spawned(u32),
    AlreadyRunning,
}

/// Why the detached child could not reach its run loop
#[derive(Debug, Error)]
pub enum StartupFailure {
    #[error("cannot create PID directory {path:?}: {source}")]
    PidDir { path: PathBuf, source: io::Error },

    #[error("PID file {0:?} already claimed")]
    PidFileTaken(PathBuf),

    #[error("cannot write PID file {path:?}: {source}")]
    PidFile { path: PathBuf, source: io::Error },

    #[error("cannot register signals: {0}")]
    Signals(io::Error),

    #[error("on_start failed: {0}")]
    OnStart(Error),
}

impl StartupFailure {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupFailure::PidDir { .. } => EXIT_PID_DIR_FAILED,
            StartupFailure::PidFileTaken(_) | StartupFailure::PidFile { .. } => {
                EXIT_PID_FILE_FAILED
            }
            StartupFailure::Signals(_) => EXIT_SIGNALS_FAILED,
            StartupFailure::OnStart(_) => EXIT_START_FAILED,
        }
    }
}

/// Shared running flag handed to `run`, so a daemon can stop itself
#[derive(Debug, Clone)]
pub struct Control {
    running: Arc<AtomicBool>,
}

impl Default for Control {
    fn default() -> Self {
        Self::new()
    }
}

impl Control {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Callbacks a concrete daemon supplies
pub trait Daemon {
    /// Called once after the pid-file is written, and again on hot restart
    fn on_start(&mut self) -> Result<()>;

    /// One bounded unit of work
    fn run(&mut self, control: &Control) -> Result<()>;

    /// Called on shutdown and before a hot restart
    fn on_stop(&mut self) -> Result<()>;

    fn handle_other_signal(&mut self, signal: i32) {
        info!(signal, "Signal not handled");
    }
}

/// Identity and options of a daemon process
#[derive(Debug, Clone)]
pub struct DaemonSpec {
    pub name: String,
    pub pid_dir: PathBuf,
    /// Signals observed on top of [`BASE_SIGNALS`]
    pub signals: Vec<i32>,
    pub uniq: bool,
}

impl DaemonSpec {
    pub fn new(name: impl Into<String>, pid_dir: &Path) -> Self {
        Self {
            name: name.into(),
            pid_dir: pid_dir.to_path_buf(),
            signals: Vec::new(),
            uniq: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.uniq = true;
        self
    }

    pub fn with_signals(mut self, signals: &[i32]) -> Self {
        self.signals.extend_from_slice(signals);
        self
    }

    pub fn pid_file(&self) -> PidFile {
        PidFile::new(&self.pid_dir, &self.name)
    }

    /// Base signals plus extras, without duplicates
    pub fn signal_set(&self) -> Vec<i32> {
        let mut set = BASE_SIGNALS.to_vec();
        for signal in &self.signals {
            if !set.contains(signal) {
                set.push(*signal);
            }
        }
        set
    }
}

/// Drives a [`Daemon`] through `Initializing → Running → Stopping → Terminated`
pub struct Lifecycle<D: Daemon> {
    spec: DaemonSpec,
    daemon: D,
    state: DaemonState,
    control: Control,
}

impl<D: Daemon> Lifecycle<D> {
    pub fn new(spec: DaemonSpec, daemon: D) -> Self {
        Self {
            spec,
            daemon,
            state: DaemonState::Initializing,
            control: Control::new(),
        }
    }

    pub fn spec(&self) -> &DaemonSpec {
        &self.spec
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    pub fn control(&self) -> Control {
        self.control.clone()
    }

    pub fn daemon(&self) -> &D {
        &self.daemon
    }

    pub fn daemon_mut(&mut self) -> &mut D {
        &mut self.daemon
    }

    /// Fork a detached child running this daemon.
    ///
    /// The calling process returns at once. The child never returns from this
    /// function: it exits with 0 after a graceful stop, or with one of the
    /// `EXIT_*` codes when startup fails.
    pub fn start(mut self) -> Result<StartOutcome> {
        if self.spec.uniq {
            let pid_file = self.spec.pid_file();
            pid_file.clear_stale()?;
            if pid_file.exists() {
                println!("Another process named {} is already running.", self.spec.name);
                info!(name = %self.spec.name, "Already running, not starting");
                return Ok(StartOutcome::AlreadyRunning);
            }
        }

        // SAFETY: the child only runs this daemon's loop, then exits without
        // returning into the caller.
        match unsafe { fork() }.map_err(Error::Fork)? {
            ForkResult::Parent { child } => {
                println!("Child process started with pid {}.", child);
                Ok(StartOutcome::Spawned(child.as_raw() as u32))
            }
            ForkResult::Child => {
                let code = self.detach_and_serve();
                std::process::exit(code);
            }
        }
    }

    fn detach_and_serve(&mut self) -> i32 {
        if let Err(e) = setsid() {
            error!(name = %self.spec.name, "critical: cannot make the child process independent: {}", e);
            return EXIT_DETACH_FAILED;
        }
        if let Err(e) = release_terminal() {
            error!(name = %self.spec.name, "critical: cannot release the caller's terminal: {}", e);
            return EXIT_DETACH_FAILED;
        }

        match self.serve() {
            Ok(()) => 0,
            Err(failure) => failure.exit_code(),
        }
    }

    /// Run the daemon in the current process until it stops.
    ///
    /// This is everything `start` does after detaching. Faults raised by `run`
    /// (errors or panics) are logged and end the loop through the normal stop
    /// path; only startup problems are returned.
    pub fn serve(&mut self) -> std::result::Result<(), StartupFailure> {
        let span = info_span!("daemon", name = %self.spec.name);
        let _enter = span.enter();

        if let Err(source) = std::fs::create_dir_all(&self.spec.pid_dir) {
            error!("critical: cannot create PID directory {}: {}", self.spec.pid_dir.display(), source);
            self.state = DaemonState::Terminated;
            return Err(StartupFailure::PidDir {
                path: self.spec.pid_dir.clone(),
                source,
            });
        }

        let mut signals = match Signals::new(self.spec.signal_set()) {
            Ok(signals) => signals,
            Err(e) => {
                error!("critical: cannot register signals: {}", e);
                self.state = DaemonState::Terminated;
                return Err(StartupFailure::Signals(e));
            }
        };

        let pid_file = self.spec.pid_file();
        if let Err(source) = pid_file.claim(std::process::id()) {
            self.state = DaemonState::Terminated;
            let path = pid_file.path().to_path_buf();
            if source.kind() == io::ErrorKind::AlreadyExists {
                error!(path = %path.display(), "critical: PID file already claimed by another process");
                return Err(StartupFailure::PidFileTaken(path));
            }
            error!(path = %path.display(), "critical: cannot write PID file: {}", source);
            return Err(StartupFailure::PidFile { path, source });
        }

        if let Err(e) = self.daemon.on_start() {
            error!("critical: start failed: {}", e);
            if let Err(e) = pid_file.remove() {
                warn!("Failed to remove PID file: {}", e);
            }
            self.control.stop();
            self.state = DaemonState::Terminated;
            return Err(StartupFailure::OnStart(e));
        }

        self.state = DaemonState::Running;
        info!(pid = std::process::id(), "Daemon running");

        while self.control.is_running() {
            let pending: Vec<i32> = signals.pending().collect();
            for signal in pending {
                self.dispatch(signal);
            }
            if !self.control.is_running() {
                break;
            }

            let control = self.control.clone();
            let daemon = &mut self.daemon;
            match catch_unwind(AssertUnwindSafe(|| daemon.run(&control))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("critical: run loop failed: {}", e);
                    break;
                }
                Err(panic) => {
                    error!("critical: run loop panicked: {}", panic_message(&panic));
                    break;
                }
            }
        }

        self.control.stop();
        self.state = DaemonState::Stopping;

        if let Err(e) = self.daemon.on_stop() {
            error!("Stop hook failed: {}", e);
        }
        if let Err(e) = pid_file.remove() {
            warn!("Failed to remove PID file: {}", e);
        }

        self.state = DaemonState::Terminated;
        info!("Daemon terminated");
        Ok(())
    }

    /// Apply the signal transition table
    pub fn dispatch(&mut self, signal: i32) {
        match signal {
            SIGTERM | SIGINT => {
                info!(signal, "Stop requested");
                self.control.stop();
            }
            SIGHUP => {
                info!("Hot restart requested");
                if let Err(e) = self.daemon.on_stop() {
                    error!("Stop hook failed during restart: {}", e);
                }
                if let Err(e) = self.daemon.on_start() {
                    error!("critical: restart failed: {}", e);
                    self.control.stop();
                }
            }
            SIGCHLD => {
                let reaped = reap_children();
                debug!(reaped, "Reaped children");
            }
            other => self.daemon.handle_other_signal(other),
        }
    }
}

/// Point stdin, stdout and stderr at `/dev/null` and leave the launch
/// directory, so a detached child holds neither the caller's pipes nor its cwd.
fn release_terminal() -> nix::Result<()> {
    let null = open(Path::new("/dev/null"), OFlag::O_RDWR, Mode::empty())?;
    for fd in 0..=2 {
        dup2(null, fd)?;
    }
    if null > 2 {
        close(null)?;
    }
    chdir(Path::new("/"))
}

/// Collect every finished child without blocking. Returns how many were reaped.
pub fn reap_children() -> usize {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                debug!(?status, "Child exited");
                reaped += 1;
            }
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("waitpid failed: {}", e);
                break;
            }
        }
    }
    reaped
}

/// Send `signal` to the daemon owning `<pid_dir>/<name>.pid`.
///
/// Returns the signalled pid, or `None` when the daemon is not running. A
/// stale pid-file is removed on the way.
pub fn signal_daemon(pid_dir: &Path, name: &str, signal: i32) -> Result<Option<u32>> {
    let pid_file = PidFile::new(pid_dir, name);
    let pid = match pid_file.status() {
        PidStatus::Absent => return Ok(None),
        PidStatus::Stale(_) => {
            pid_file.clear_stale()?;
            return Ok(None);
        }
        PidStatus::Live(None) => {
            return Err(Error::Daemon(format!(
                "PID file {} is unreadable",
                pid_file.path().display()
            )))
        }
        PidStatus::Live(Some(pid)) => pid,
    };

    let to_error = |e: nix::Error| Error::Signal {
        signal,
        reason: e.to_string(),
    };
    let sig = Signal::try_from(signal).map_err(to_error)?;
    let raw = i32::try_from(pid).map_err(|_| Error::Daemon(format!("invalid pid {}", pid)))?;
    kill(Pid::from_raw(raw), sig).map_err(to_error)?;
    Ok(Some(pid))
}

/// Poll until the daemon's pid-file is gone. Returns false on timeout.
pub fn wait_for_exit(pid_dir: &Path, name: &str, timeout: Duration) -> bool {
    let pid_file = PidFile::new(pid_dir, name);
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pid_file.clear_stale().unwrap_or(false) || !pid_file.exists() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    !pid_file.exists()
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_hook::consts::SIGUSR1;
    use tempfile::TempDir;

    /// What the recording daemon should do on its n-th run
    #[derive(Clone, Copy)]
    enum Fault {
        None,
        Error,
        Panic,
    }

    struct Recorder {
        events: Vec<String>,
        runs: usize,
        stop_after: usize,
        fault: Fault,
        fail_start: bool,
        pid_file: Option<PidFile>,
        pid_file_seen: bool,
    }

    impl Recorder {
        fn new(stop_after: usize) -> Self {
            Self {
                events: Vec::new(),
                runs: 0,
                stop_after,
                fault: Fault::None,
                fail_start: false,
                pid_file: None,
                pid_file_seen: false,
            }
        }
    }

    impl Daemon for Recorder {
        fn on_start(&mut self) -> Result<()> {
            self.events.push("start".to_string());
            if self.fail_start {
                return Err(Error::Config("bad adapter".to_string()));
            }
            Ok(())
        }

        fn run(&mut self, control: &Control) -> Result<()> {
            self.runs += 1;
            self.events.push("run".to_string());
            if let Some(pid_file) = &self.pid_file {
                self.pid_file_seen = pid_file.read_pid() == Some(std::process::id());
            }
            match self.fault {
                Fault::Error => return Err(Error::Daemon("transport exploded".to_string())),
                Fault::Panic => panic!("worker bug"),
                Fault::None => {}
            }
            if self.runs >= self.stop_after {
                control.stop();
            }
            Ok(())
        }

        fn on_stop(&mut self) -> Result<()> {
            self.events.push("stop".to_string());
            Ok(())
        }

        fn handle_other_signal(&mut self, signal: i32) {
            self.events.push(format!("signal:{}", signal));
        }
    }

    fn spec(temp_dir: &TempDir) -> DaemonSpec {
        DaemonSpec::new("recorder", &temp_dir.path().join("pid")).unique()
    }

    #[test]
    fn test_signal_set_dedupes_extras() {
        let spec = DaemonSpec::new("x", Path::new("/tmp")).with_signals(&[SIGUSR1, SIGHUP]);
        let set = spec.signal_set();
        assert_eq!(set.len(), 5);
        assert!(set.contains(&SIGUSR1));
    }

    #[test]
    fn test_term_and_int_request_stop() {
        for signal in [SIGTERM, SIGINT] {
            let temp_dir = TempDir::new().unwrap();
            let mut lifecycle = Lifecycle::new(spec(&temp_dir), Recorder::new(10));
            assert!(lifecycle.is_running());
            lifecycle.dispatch(signal);
            assert!(!lifecycle.is_running());
            assert!(lifecycle.daemon().events.is_empty());
        }
    }

    #[test]
    fn test_hup_restarts_once_and_keeps_running() {
        let temp_dir = TempDir::new().unwrap();
        let mut lifecycle = Lifecycle::new(spec(&temp_dir), Recorder::new(10));
        lifecycle.dispatch(SIGHUP);
        assert_eq!(lifecycle.daemon().events, vec!["stop", "start"]);
        assert!(lifecycle.is_running());
    }

    #[test]
    fn test_failed_restart_requests_stop() {
        let temp_dir = TempDir::new().unwrap();
        let mut recorder = Recorder::new(10);
        recorder.fail_start = true;
        let mut lifecycle = Lifecycle::new(spec(&temp_dir), recorder);
        lifecycle.dispatch(SIGHUP);
        assert!(!lifecycle.is_running());
    }

    #[test]
    fn test_other_signals_are_delegated() {
        let temp_dir = TempDir::new().unwrap();
        let mut lifecycle = Lifecycle::new(spec(&temp_dir), Recorder::new(10));
        lifecycle.dispatch(SIGUSR1);
        assert_eq!(lifecycle.daemon().events, vec![format!("signal:{}", SIGUSR1)]);
        assert!(lifecycle.is_running());
    }

    #[test]
    fn test_serve_runs_until_stopped() {
        let temp_dir = TempDir::new().unwrap();
        let spec = spec(&temp_dir);
        let mut recorder = Recorder::new(3);
        recorder.pid_file = Some(spec.pid_file());
        let mut lifecycle = Lifecycle::new(spec.clone(), recorder);

        lifecycle.serve().unwrap();

        let daemon = lifecycle.daemon();
        assert_eq!(daemon.runs, 3);
        assert_eq!(daemon.events.first().map(String::as_str), Some("start"));
        assert_eq!(daemon.events.last().map(String::as_str), Some("stop"));
        assert!(daemon.pid_file_seen, "pid file should hold our pid while running");
        assert!(!spec.pid_file().exists());
        assert_eq!(lifecycle.state(), DaemonState::Terminated);
        assert!(!lifecycle.is_running());
    }

    #[test]
    fn test_serve_turns_run_error_into_stop() {
        let temp_dir = TempDir::new().unwrap();
        let spec = spec(&temp_dir);
        let mut recorder = Recorder::new(100);
        recorder.fault = Fault::Error;
        let mut lifecycle = Lifecycle::new(spec.clone(), recorder);

        lifecycle.serve().unwrap();

        assert_eq!(lifecycle.daemon().events, vec!["start", "run", "stop"]);
        assert!(!spec.pid_file().exists());
        assert_eq!(lifecycle.state(), DaemonState::Terminated);
    }

    #[test]
    fn test_serve_turns_run_panic_into_stop() {
        let temp_dir = TempDir::new().unwrap();
        let spec = spec(&temp_dir);
        let mut recorder = Recorder::new(100);
        recorder.fault = Fault::Panic;
        let mut lifecycle = Lifecycle::new(spec.clone(), recorder);

        lifecycle.serve().unwrap();

        assert_eq!(lifecycle.daemon().events, vec!["start", "run", "stop"]);
        assert!(!spec.pid_file().exists());
    }

    #[test]
    fn test_start_failure_never_reaches_running() {
        let temp_dir = TempDir::new().unwrap();
        let spec = spec(&temp_dir);
        let mut recorder = Recorder::new(1);
        recorder.fail_start = true;
        let mut lifecycle = Lifecycle::new(spec.clone(), recorder);

        let failure = lifecycle.serve().unwrap_err();
        assert!(matches!(failure, StartupFailure::OnStart(Error::Config(_))));
        assert_eq!(failure.exit_code(), EXIT_START_FAILED);
        assert_eq!(lifecycle.daemon().runs, 0);
        assert!(!spec.pid_file().exists());
        assert_eq!(lifecycle.state(), DaemonState::Terminated);
    }

    #[test]
    fn test_serve_refuses_claimed_pid_file() {
        let temp_dir = TempDir::new().unwrap();
        let spec = spec(&temp_dir);
        std::fs::create_dir_all(&spec.pid_dir).unwrap();
        spec.pid_file().claim(4242).unwrap();

        let mut lifecycle = Lifecycle::new(spec.clone(), Recorder::new(1));
        let failure = lifecycle.serve().unwrap_err();

        assert!(matches!(failure, StartupFailure::PidFileTaken(_)));
        assert_eq!(failure.exit_code(), EXIT_PID_FILE_FAILED);
        assert!(lifecycle.daemon().events.is_empty());
        assert_eq!(spec.pid_file().read_pid(), Some(4242));
    }

    #[test]
    fn test_serve_reports_pid_dir_failure() {
        let temp_dir = TempDir::new().unwrap();
        // A regular file where the directory should go
        let blocker = temp_dir.path().join("pid");
        std::fs::write(&blocker, "").unwrap();
        let spec = DaemonSpec::new("recorder", &blocker.join("nested"));

        let mut lifecycle = Lifecycle::new(spec, Recorder::new(1));
        let failure = lifecycle.serve().unwrap_err();
        assert_eq!(failure.exit_code(), EXIT_PID_DIR_FAILED);
    }

    #[test]
    fn test_start_refuses_while_pid_file_is_live() {
        let temp_dir = TempDir::new().unwrap();
        let spec = spec(&temp_dir);
        std::fs::create_dir_all(&spec.pid_dir).unwrap();
        // Our own pid is certainly alive
        spec.pid_file().claim(std::process::id()).unwrap();

        for _ in 0..2 {
            let lifecycle = Lifecycle::new(spec.clone(), Recorder::new(1));
            let outcome = lifecycle.start().unwrap();
            assert_eq!(outcome, StartOutcome::AlreadyRunning);
        }
        assert_eq!(spec.pid_file().read_pid(), Some(std::process::id()));
    }

    #[test]
    fn test_signal_daemon_without_live_process() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(signal_daemon(temp_dir.path(), "sender", SIGHUP).unwrap(), None);

        let stale = PidFile::new(temp_dir.path(), "sender");
        std::fs::write(stale.path(), "999999999").unwrap();
        assert_eq!(signal_daemon(temp_dir.path(), "sender", SIGTERM).unwrap(), None);
        assert!(!stale.exists());
        assert!(wait_for_exit(temp_dir.path(), "sender", Duration::from_millis(10)));

        std::fs::write(stale.path(), "garbage").unwrap();
        assert!(signal_daemon(temp_dir.path(), "sender", SIGTERM).is_err());
        assert!(!wait_for_exit(temp_dir.path(), "sender", Duration::from_millis(10)));
    }

    #[test]
    fn test_signal_daemon_reports_unsendable_signal() {
        let temp_dir = TempDir::new().unwrap();
        PidFile::new(temp_dir.path(), "sender")
            .claim(std::process::id())
            .unwrap();

        // Not a signal number: rejected before anything reaches kill
        let err = signal_daemon(temp_dir.path(), "sender", 999).unwrap_err();
        assert!(matches!(err, Error::Signal { signal: 999, .. }));
        assert!(err.to_string().starts_with("Cannot send signal 999"));
    }

    #[test]
    fn test_startup_failure_exit_codes_are_distinct() {
        let codes = [
            EXIT_DETACH_FAILED,
            EXIT_PID_DIR_FAILED,
            EXIT_PID_FILE_FAILED,
            EXIT_START_FAILED,
            EXIT_SIGNALS_FAILED,
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
        assert!(!codes.contains(&0));
    }
}
