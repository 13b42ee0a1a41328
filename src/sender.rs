//! Sender: moves due scheduled messages onto their phone's channel

use crate::channel::{InboundChannel, QueueKey};
use crate::config::{Config, SENDER_NAME};
use crate::daemon::{Control, Daemon, DaemonSpec};
use crate::error::{Error, Result};
use crate::phone::OutgoingSms;
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::{info, warn};

/// Push every due scheduled message to its phone worker and drop the row.
/// Returns how many messages were queued.
pub fn dispatch_due(store: &Store, queue_dir: &Path, now: DateTime<Utc>) -> Result<usize> {
    let mut queued = 0;

    for scheduled in store.due_scheduled(now)? {
        let phone = match store.phone(scheduled.id_phone)? {
            Some(phone) => phone,
            None => {
                warn!(id = scheduled.id, id_phone = scheduled.id_phone, "Dropping scheduled SMS for unknown phone");
                store.delete_scheduled(scheduled.id)?;
                continue;
            }
        };

        let sms = OutgoingSms {
            destination: scheduled.destination,
            text: scheduled.text,
            flash: scheduled.flash,
        };
        let channel = InboundChannel::open(queue_dir, QueueKey::from_number(&phone.number))?;
        match channel.send(&sms.to_message()?) {
            Ok(()) => queued += 1,
            Err(e @ Error::PayloadTooLarge { .. }) => {
                warn!(id = scheduled.id, "Dropping scheduled SMS: {}", e);
            }
            Err(e) => return Err(e),
        }
        store.delete_scheduled(scheduled.id)?;
    }

    Ok(queued)
}

pub struct Sender {
    config: Config,
    store: Option<Store>,
}

impl Sender {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            store: None,
        }
    }

    pub fn spec(&self) -> DaemonSpec {
        DaemonSpec::new(SENDER_NAME, &self.config.pid_dir).unique()
    }
}

impl Daemon for Sender {
    fn on_start(&mut self) -> Result<()> {
        self.store = Some(Store::open(&self.config.database)?);
        info!("Sender started");
        Ok(())
    }

    fn run(&mut self, _control: &Control) -> Result<()> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| Error::Daemon("sender used before on_start".to_string()))?;
        let queued = dispatch_due(store, &self.config.queue_dir, Utc::now())?;
        if queued > 0 {
            info!(queued, "Scheduled messages handed to phone workers");
        }
        std::thread::sleep(self.config.sender_interval());
        Ok(())
    }

    fn on_stop(&mut self) -> Result<()> {
        self.store = None;
        info!("Sender stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MAX_PAYLOAD, SEND_SMS};
    use chrono::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_due_messages_reach_phone_channel() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let id_phone = store.insert_phone("+33612345678", "test", "{}").unwrap();
        let now = Utc::now();
        store
            .insert_scheduled(id_phone, "+33700000001", "first", false, now - Duration::seconds(10))
            .unwrap();
        store
            .insert_scheduled(id_phone, "+33700000002", "second", true, now - Duration::seconds(5))
            .unwrap();
        store
            .insert_scheduled(id_phone, "+33700000003", "later", false, now + Duration::hours(1))
            .unwrap();

        assert_eq!(dispatch_due(&store, temp_dir.path(), now).unwrap(), 2);

        let channel =
            InboundChannel::open(temp_dir.path(), QueueKey::from_number("+33612345678")).unwrap();
        let first = channel.try_receive().unwrap().unwrap();
        assert_eq!(first.kind, SEND_SMS);
        let sms: OutgoingSms = serde_json::from_slice(&first.payload).unwrap();
        assert_eq!(sms.text, "first");
        let second: OutgoingSms =
            serde_json::from_slice(&channel.try_receive().unwrap().unwrap().payload).unwrap();
        assert!(second.flash);
        assert!(channel.try_receive().unwrap().is_none());

        assert!(store.due_scheduled(now).unwrap().is_empty());
        assert_eq!(store.due_scheduled(now + Duration::hours(2)).unwrap().len(), 1);
    }

    #[test]
    fn test_orphan_rows_are_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .insert_scheduled(42, "+33700000001", "nobody", false, now)
            .unwrap();

        assert_eq!(dispatch_due(&store, temp_dir.path(), now).unwrap(), 0);
        assert!(store.due_scheduled(now).unwrap().is_empty());
    }

    #[test]
    fn test_oversized_rows_are_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let id_phone = store.insert_phone("+33612345678", "test", "{}").unwrap();
        let now = Utc::now();
        let text = "x".repeat(MAX_PAYLOAD);
        store
            .insert_scheduled(id_phone, "+33700000001", &text, false, now)
            .unwrap();

        assert_eq!(dispatch_due(&store, temp_dir.path(), now).unwrap(), 0);
        assert!(store.due_scheduled(now).unwrap().is_empty());
    }

    #[test]
    fn test_run_requires_start() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::for_test(temp_dir.path());
        let mut sender = Sender::new(&config);
        assert!(sender.run(&Control::new()).is_err());

        sender.on_start().unwrap();
        sender.run(&Control::new()).unwrap();
        assert_eq!(sender.spec().name, "sender");
    }
}
