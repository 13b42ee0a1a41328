//! Command line tests
//!
//! Most of these exercise commands that return before any fork. The sender
//! test starts a real detached daemon and stops it again.

use assert_cmd::Command;
use chrono::Utc;
use predicates::prelude::*;
use smsgate::adapter::{DeliveryStatus, SmsEnvelope};
use smsgate::store::Store;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("smsgate.toml");
    let content = format!(
        "home = {home:?}\npid_dir = {pid:?}\nlogs_dir = {logs:?}\nqueue_dir = {queues:?}\ndata_dir = {data:?}\ndatabase = {db:?}\n",
        home = dir.display().to_string(),
        pid = dir.join("pid").display().to_string(),
        logs = dir.join("logs").display().to_string(),
        queues = dir.join("queues").display().to_string(),
        data = dir.join("data").display().to_string(),
        db = dir.join("data/smsgate.db").display().to_string(),
    );
    fs::write(&path, content).unwrap();
    path
}

fn smsgate(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("smsgate").unwrap();
    cmd.arg("--config").arg(config);
    cmd
}

#[test]
fn test_adapters_lists_schema() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path());

    smsgate(&config)
        .arg("adapters")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"id\": \"test\""))
        .stdout(predicate::str::contains("read_file"))
        .stdout(predicate::str::contains("write_file"));
}

#[test]
fn test_unknown_phone_fails_before_start() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path());

    smsgate(&config)
        .args(["phone", "--id_phone=999"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Phone not found: 999"));
    assert!(!temp_dir.path().join("pid").exists());
}

#[test]
fn test_add_phone_and_test_it() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path());
    let datas = serde_json::json!({
        "read_file": temp_dir.path().join("inbox.json"),
        "write_file": temp_dir.path().join("outbox.json"),
    })
    .to_string();

    smsgate(&config)
        .args(["add-phone", "+33 6 12 34 56 78", "--adapter", "test", "--datas", &datas])
        .assert()
        .success()
        .stdout(predicate::str::contains("Phone +33612345678 added with id 1"));

    smsgate(&config)
        .args(["test-phone", "--id_phone=1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("adapter OK"));

    smsgate(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Supervisor not running"))
        .stdout(predicate::str::contains("phone-+33612345678"))
        .stdout(predicate::str::contains("pid_file_missing"));
}

#[test]
fn test_add_phone_rejects_bad_settings() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path());

    smsgate(&config)
        .args(["add-phone", "+33612345678", "--adapter", "gammu"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown adapter: gammu"));

    smsgate(&config)
        .args(["add-phone", "+33612345678", "--adapter", "test", "--datas", "{}"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing required fields"));
}

#[test]
fn test_schedule_requires_known_phone() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path());

    smsgate(&config)
        .args(["schedule", "--id_phone=4", "+33700000001", "Hello"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("phone 4 not found"));
}

#[test]
fn test_stop_and_reload_when_not_running() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path());

    smsgate(&config)
        .args(["stop", "sender"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sender not running"));

    smsgate(&config)
        .args(["reload", "manager"])
        .assert()
        .success()
        .stdout(predicate::str::contains("manager not running"));
}

#[test]
fn test_status_callback_updates_sent_message() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path());

    let store = Store::open(&temp_dir.path().join("data/smsgate.db")).unwrap();
    let id_phone = store.insert_phone("+33612345678", "test", "{}").unwrap();
    let envelope = SmsEnvelope {
        uid: "abc123".to_string(),
        text: "Bonjour".to_string(),
        origin: "+33612345678".to_string(),
        destination: "+33700000001".to_string(),
        at: Utc::now(),
        flash: false,
        status: DeliveryStatus::Unknown,
    };
    store.insert_sended(id_phone, &envelope).unwrap();

    smsgate(&config)
        .args(["status-callback", "test", "uid=abc123", "dlr=1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Message abc123 is now delivered"));
    assert_eq!(
        store.sendeds(id_phone).unwrap()[0].envelope.status,
        DeliveryStatus::Delivered
    );

    // Without a uid the test adapter cannot match the notification
    smsgate(&config)
        .args(["status-callback", "test", "dlr=2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Notification ignored by test"));
    assert_eq!(
        store.sendeds(id_phone).unwrap()[0].envelope.status,
        DeliveryStatus::Delivered
    );
}

#[test]
fn test_status_callback_rejects_bad_input() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path());

    smsgate(&config)
        .args(["status-callback", "test", "uid"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected key=value"));

    smsgate(&config)
        .args(["status-callback", "gammu", "uid=abc123"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown adapter: gammu"));
}

/// Stops the sender if a failed assertion leaves it running
struct StopOnDrop<'a>(&'a Path);

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        let _ = smsgate(self.0).args(["stop", "sender"]).output();
    }
}

fn wait_for_pid(pid_file: &Path, timeout: Duration) -> Option<u32> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(pid) = fs::read_to_string(pid_file)
            .ok()
            .and_then(|content| content.trim().parse().ok())
        {
            return Some(pid);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    None
}

#[test]
fn test_sender_daemon_start_and_stop() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path());
    let pid_file = temp_dir.path().join("pid/sender.pid");
    let _guard = StopOnDrop(&config);

    let launcher = std::process::Command::new(env!("CARGO_BIN_EXE_smsgate"))
        .arg("--config")
        .arg(&config)
        .arg("sender")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    let launcher_pid = launcher.id();

    // The caller's pipes reach EOF as soon as the launcher exits, even
    // though the detached daemon lives on
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(launcher.wait_with_output());
    });
    let output = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("daemon kept the caller's stdout open")
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let announced: u32 = stdout
        .lines()
        .find_map(|line| line.strip_prefix("Child process started with pid "))
        .and_then(|rest| rest.trim_end_matches('.').parse().ok())
        .unwrap();

    let pid = wait_for_pid(&pid_file, Duration::from_secs(5)).unwrap();
    assert_eq!(pid, announced);
    assert_ne!(pid, launcher_pid);
    assert_ne!(pid, std::process::id());

    smsgate(&config)
        .arg("sender")
        .assert()
        .success()
        .stdout(predicate::str::contains("already running"));
    assert_eq!(wait_for_pid(&pid_file, Duration::from_secs(1)), Some(pid));

    smsgate(&config)
        .args(["stop", "sender"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sender stopped"));
    assert!(!pid_file.exists());
}
