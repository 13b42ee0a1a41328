//! Per-phone inbound channel
//!
//! A channel is a spool directory `<queue_dir>/<key>/`. Every message is one
//! file, published by renaming a dot-prefixed temp file, so readers never see a
//! partial write. File names sort by enqueue time, which gives FIFO order.
//! A reader claims a message by renaming it to a dot-prefixed name of its
//! own before reading it, so a message sharing a key with several readers is
//! taken exactly once.
//! The directory outlives its producers and consumers until `destroy`.

use crate::error::{Error, Result};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Largest payload a channel accepts
pub const MAX_PAYLOAD: usize = 409_600;

/// Message type carrying a JSON `OutgoingSms`
pub const SEND_SMS: u64 = 1;

const TAG_LEN: usize = 8;
const MESSAGE_EXT: &str = "msg";
const POLL_INTERVAL: Duration = Duration::from_millis(25);

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Channel identifier derived from a phone number.
///
/// Drops the first character (normally `+`) and reads the leading digits
/// that follow. Numbers sharing that digit run share a key, e.g.
/// `+33612345678` and `033612345678`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey(pub u64);

impl QueueKey {
    pub fn from_number(number: &str) -> Self {
        let mut chars = number.chars();
        chars.next();
        let key = chars
            .take_while(|c| c.is_ascii_digit())
            .fold(0u64, |acc, c| {
                acc.wrapping_mul(10)
                    .wrapping_add(u64::from(c as u8 - b'0'))
            });
        QueueKey(key)
    }
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub kind: u64,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(kind: u64, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }
}

#[derive(Debug)]
pub struct InboundChannel {
    key: QueueKey,
    dir: PathBuf,
}

impl InboundChannel {
    /// Open the channel for `key`, creating it if absent
    pub fn open(queue_dir: &Path, key: QueueKey) -> Result<Self> {
        let dir = queue_dir.join(key.to_string());
        fs::create_dir_all(&dir)?;
        Ok(Self { key, dir })
    }

    pub fn key(&self) -> QueueKey {
        self.key
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Enqueue a message
    pub fn send(&self, message: &InboundMessage) -> Result<()> {
        if message.payload.len() > MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge {
                size: message.payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        let mut temp = tempfile::Builder::new()
            .prefix(".incoming-")
            .tempfile_in(&self.dir)?;
        temp.write_all(&message.kind.to_le_bytes())?;
        temp.write_all(&message.payload)?;
        temp.as_file().sync_all()?;

        let target = self.dir.join(next_message_name());
        persist(temp, &target)?;
        debug!(key = %self.key, file = %target.display(), "Message enqueued");
        Ok(())
    }

    /// Take the oldest message, waiting up to `timeout` for one to arrive
    pub fn receive(&self, timeout: Duration) -> Result<Option<InboundMessage>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_receive()? {
                return Ok(Some(message));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Take the oldest message without waiting
    pub fn try_receive(&self) -> Result<Option<InboundMessage>> {
        for path in self.pending()? {
            let claimed = self.dir.join(next_claim_name());
            match fs::rename(&path, &claimed) {
                Ok(()) => {}
                // Taken by another reader in the meantime
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
            let bytes = fs::read(&claimed);
            remove_if_present(&claimed)?;
            let bytes = match bytes {
                Ok(bytes) => bytes,
                // The channel was destroyed under us
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            if bytes.len() < TAG_LEN {
                warn!(key = %self.key, file = %path.display(), "Discarding truncated message");
                continue;
            }
            let payload_len = bytes.len() - TAG_LEN;
            if payload_len > MAX_PAYLOAD {
                warn!(key = %self.key, size = payload_len, "Discarding oversized message");
                continue;
            }

            let mut tag = [0u8; TAG_LEN];
            tag.copy_from_slice(&bytes[..TAG_LEN]);
            return Ok(Some(InboundMessage {
                kind: u64::from_le_bytes(tag),
                payload: bytes[TAG_LEN..].to_vec(),
            }));
        }
        Ok(None)
    }

    /// Number of messages waiting
    pub fn len(&self) -> Result<usize> {
        Ok(self.pending()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Delete the channel and anything still queued in it
    pub fn destroy(self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Published message files, oldest first
    fn pending(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                let visible = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| !n.starts_with('.'))
                    .unwrap_or(false);
                visible && path.extension().and_then(|e| e.to_str()) == Some(MESSAGE_EXT)
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

/// `<nanos>-<pid>-<seq>.msg`, zero padded so names sort by enqueue time
fn next_message_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!(
        "{:024}-{:010}-{:020}.{}",
        nanos,
        std::process::id(),
        seq,
        MESSAGE_EXT
    )
}

/// `.claimed-<pid>-<seq>`, unique per reader and hidden from `pending`
fn next_claim_name() -> String {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!(".claimed-{}-{}", std::process::id(), seq)
}

fn persist(temp: NamedTempFile, target: &Path) -> Result<()> {
    temp.persist(target).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
