//! Signal handling of a served daemon
//!
//! Kept in its own test binary: it raises real signals at the test process.

use signal_hook::consts::{SIGHUP, SIGTERM};
use signal_hook::low_level::raise;
use smsgate::daemon::{Control, Daemon, DaemonSpec, DaemonState, Lifecycle};
use smsgate::error::Result;
use smsgate::pidfile::PidFile;
use tempfile::TempDir;

struct Scripted {
    pid_file: PidFile,
    events: Vec<String>,
    runs: usize,
}

impl Daemon for Scripted {
    fn on_start(&mut self) -> Result<()> {
        self.events.push("start".to_string());
        Ok(())
    }

    fn run(&mut self, control: &Control) -> Result<()> {
        self.runs += 1;
        let pid = self.pid_file.read_pid();
        self.events.push(format!("run:{}", pid == Some(std::process::id())));
        match self.runs {
            1 => raise(SIGHUP)?,
            2 => raise(SIGTERM)?,
            // Safety net so a lost signal cannot hang the test
            _ => control.stop(),
        }
        Ok(())
    }

    fn on_stop(&mut self) -> Result<()> {
        self.events.push("stop".to_string());
        Ok(())
    }
}

#[test]
fn test_reload_then_terminate() {
    let temp_dir = TempDir::new().unwrap();
    let spec = DaemonSpec::new("scripted", &temp_dir.path().join("pid")).unique();
    let daemon = Scripted {
        pid_file: spec.pid_file(),
        events: Vec::new(),
        runs: 0,
    };

    let mut lifecycle = Lifecycle::new(spec.clone(), daemon);
    assert_eq!(lifecycle.state(), DaemonState::Initializing);
    lifecycle.serve().unwrap();

    // HUP: one stop/start pair, pid-file kept, loop continues.
    // TERM: loop ends before a third run.
    assert_eq!(
        lifecycle.daemon().events,
        vec!["start", "run:true", "stop", "start", "run:true", "stop"]
    );
    assert_eq!(lifecycle.daemon().runs, 2);
    assert_eq!(lifecycle.state(), DaemonState::Terminated);
    assert!(!spec.pid_file().exists());
}
