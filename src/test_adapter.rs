//! Filesystem test harness adapter
//!
//! Sent messages are appended as JSON lines to `write_file`; received messages
//! are taken from `read_file`, one JSON object per line, and the file is
//! emptied so nothing is read twice.

use crate::adapter::{
    Adapter, AdapterConfig, CallbackParams, DeliveryStatus, FieldSpec, SendFailure, SmsEnvelope,
    StatusUpdate,
};
use crate::error::{Error, Result};
use chrono::{NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

pub const ID: &str = "test";
pub const NAME: &str = "Test";
pub const DESCRIPTION: &str =
    "A test adapter that keeps messages in local files instead of talking to a carrier.";

pub const FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "read_file",
        title: "Read file",
        description: "File holding incoming messages, one JSON object per line.",
        required: true,
    },
    FieldSpec {
        name: "write_file",
        title: "Write file",
        description: "File that sent messages are appended to, one JSON object per line.",
        required: true,
    },
];

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

static UID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Line format shared by both files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub flash: bool,
}

pub struct TestAdapter {
    number: String,
    read_file: PathBuf,
    write_file: PathBuf,
}

impl TestAdapter {
    pub fn new(config: &AdapterConfig) -> Result<Self> {
        let read_file = config
            .field("read_file")
            .ok_or_else(|| Error::Config("read_file is missing".to_string()))?;
        let write_file = config
            .field("write_file")
            .ok_or_else(|| Error::Config("write_file is missing".to_string()))?;

        Ok(Self {
            number: config.number.clone(),
            read_file: PathBuf::from(read_file),
            write_file: PathBuf::from(write_file),
        })
    }

    /// Registry constructor
    pub fn build(config: &AdapterConfig) -> Result<Box<dyn Adapter>> {
        Ok(Box::new(Self::new(config)?))
    }

    fn append(&self, entry: &FileEntry) -> io::Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.write_file)?;
        file.write_all(line.as_bytes())
    }

    /// Take the whole read file and leave it empty
    fn drain(&self) -> io::Result<String> {
        let content = match fs::read_to_string(&self.read_file) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e),
        };
        if !content.is_empty() {
            fs::write(&self.read_file, "")?;
        }
        Ok(content)
    }

    fn to_envelope(&self, entry: FileEntry) -> SmsEnvelope {
        let at = entry
            .at
            .as_deref()
            .and_then(|s| NaiveDateTime::parse_from_str(s, DATE_FORMAT).ok())
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or_else(Utc::now);

        SmsEnvelope {
            uid: entry.uid.unwrap_or_else(new_uid),
            text: entry.text,
            origin: entry.origin.unwrap_or_else(|| self.number.clone()),
            destination: entry.destination.unwrap_or_else(|| self.number.clone()),
            at,
            flash: entry.flash,
            status: DeliveryStatus::Delivered,
        }
    }
}

impl Adapter for TestAdapter {
    fn send(&mut self, destination: &str, text: &str, flash: bool) -> std::result::Result<String, SendFailure> {
        let uid = new_uid();
        let entry = FileEntry {
            uid: Some(uid.clone()),
            at: Some(Utc::now().format(DATE_FORMAT).to_string()),
            origin: None,
            destination: Some(destination.to_string()),
            text: text.to_string(),
            flash,
        };

        match self.append(&entry) {
            Ok(()) => {
                debug!(uid = %uid, destination, "Test adapter wrote message");
                Ok(uid)
            }
            Err(e) => Err(SendFailure::new(format!(
                "cannot write {}: {}",
                self.write_file.display(),
                e
            ))),
        }
    }

    fn read(&mut self) -> Vec<SmsEnvelope> {
        let content = match self.drain() {
            Ok(content) => content,
            Err(e) => {
                warn!(file = %self.read_file.display(), "Test adapter cannot read: {}", e);
                return Vec::new();
            }
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<FileEntry>(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping malformed test message: {}", e);
                    None
                }
            })
            .map(|entry| self.to_envelope(entry))
            .collect()
    }

    fn test(&mut self) -> bool {
        [&self.read_file, &self.write_file].iter().all(|path| {
            path.parent()
                .map(|p| p.as_os_str().is_empty() || p.is_dir())
                .unwrap_or(false)
        })
    }
}

/// Translate a delivery report: `dlr` 1 is delivered, 2 and 16 are failures
pub fn status_change_callback(params: &CallbackParams) -> Option<StatusUpdate> {
    let uid = params.get("uid")?;
    let dlr = params.get("dlr")?;

    let status = match dlr.trim() {
        "1" => DeliveryStatus::Delivered,
        "2" | "16" => DeliveryStatus::Failed,
        _ => DeliveryStatus::Unknown,
    };

    Some(StatusUpdate {
        uid: uid.clone(),
        status,
    })
}

/// Unique-enough message id: hex of the current time, pid and a counter
fn new_uid() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let mut bytes = Vec::with_capacity(16);
    bytes.extend_from_slice(&nanos.to_be_bytes());
    bytes.extend_from_slice(&std::process::id().to_be_bytes());
    bytes.extend_from_slice(&UID_COUNTER.fetch_add(1, Ordering::Relaxed).to_be_bytes());
    hex::encode(bytes)
}
