//! Per-phone worker
//!
//! One process per phone line. It drains the line's inbound channel, sends
//! through the phone's adapter, and polls the adapter for received messages.
//! After a long quiet spell it stops itself; the supervisor brings it back.

use crate::adapter::{AdapterHandle, DeliveryStatus, SmsEnvelope};
use crate::channel::{InboundChannel, InboundMessage, QueueKey, SEND_SMS};
use crate::config::{phone_daemon_name, Config};
use crate::daemon::{Control, Daemon, DaemonSpec};
use crate::error::{Error, Result};
use crate::registry::AdapterRegistry;
use crate::store::{Phone, Store, WEBHOOK_RECEIVE_SMS};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Payload of a `SEND_SMS` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingSms {
    pub destination: String,
    pub text: String,
    #[serde(default)]
    pub flash: bool,
}

impl OutgoingSms {
    pub fn to_message(&self) -> Result<InboundMessage> {
        Ok(InboundMessage::new(SEND_SMS, serde_json::to_vec(self)?))
    }
}

pub struct PhoneWorker {
    config: Config,
    phone: Phone,
    key: QueueKey,
    adapter: AdapterHandle,
    channel: Option<InboundChannel>,
    store: Option<Store>,
    idle_timeout: Duration,
    last_activity: Instant,
    last_read: Option<Instant>,
}

impl PhoneWorker {
    /// Build the worker for phone `id_phone`.
    ///
    /// Unknown phones, unknown adapters and bad adapter settings fail here,
    /// before anything is forked.
    pub fn new(config: &Config, store: &Store, registry: &AdapterRegistry, id_phone: i64) -> Result<Self> {
        let phone = store.phone(id_phone)?.ok_or(Error::PhoneNotFound(id_phone))?;
        let adapter = registry.construct(&phone.adapter, &phone.number, &phone.adapter_datas)?;

        Ok(Self {
            config: config.clone(),
            key: QueueKey::from_number(&phone.number),
            phone,
            adapter,
            channel: None,
            store: None,
            idle_timeout: config.idle_timeout(),
            last_activity: Instant::now(),
            last_read: None,
        })
    }

    pub fn spec(&self) -> DaemonSpec {
        DaemonSpec::new(phone_daemon_name(&self.phone.number), &self.config.pid_dir).unique()
    }

    pub fn phone(&self) -> &Phone {
        &self.phone
    }

    pub fn key(&self) -> QueueKey {
        self.key
    }

    /// Run the adapter's health check
    pub fn test_adapter(&mut self) -> bool {
        self.adapter.test()
    }

    fn is_idle(&self) -> bool {
        self.last_activity.elapsed() > self.idle_timeout
    }

    fn handle(&mut self, message: InboundMessage) -> Result<()> {
        match message.kind {
            SEND_SMS => {
                let sms: OutgoingSms = match serde_json::from_slice(&message.payload) {
                    Ok(sms) => sms,
                    Err(e) => {
                        warn!(key = %self.key, "Dropping unreadable SEND_SMS payload: {}", e);
                        return Ok(());
                    }
                };
                self.send(&sms)
            }
            other => {
                warn!(key = %self.key, kind = other, "Ignoring unknown message type");
                Ok(())
            }
        }
    }

    fn send(&mut self, sms: &OutgoingSms) -> Result<()> {
        let store = self.store.as_ref().ok_or_else(not_started)?;

        let (uid, status) = match self.adapter.send(&sms.destination, &sms.text, sms.flash) {
            Ok(uid) => {
                info!(uid = %uid, destination = %sms.destination, "SMS sent");
                (uid, DeliveryStatus::Unknown)
            }
            Err(failure) => {
                warn!(destination = %sms.destination, "{}", failure);
                (String::new(), DeliveryStatus::Failed)
            }
        };

        let envelope = SmsEnvelope {
            uid,
            text: sms.text.clone(),
            origin: self.phone.number.clone(),
            destination: sms.destination.clone(),
            at: Utc::now(),
            flash: sms.flash,
            status,
        };
        store.insert_sended(self.phone.id, &envelope)?;
        Ok(())
    }

    /// Poll the adapter when the read interval has elapsed
    fn read_if_due(&mut self) -> Result<usize> {
        let due = self
            .last_read
            .map(|at| at.elapsed() >= self.config.read_interval())
            .unwrap_or(true);
        if !due {
            return Ok(0);
        }
        self.last_read = Some(Instant::now());

        let store = self.store.as_ref().ok_or_else(not_started)?;
        let envelopes = self.adapter.read();
        if envelopes.is_empty() {
            return Ok(0);
        }

        let webhooks = store.webhooks_by_type(WEBHOOK_RECEIVE_SMS)?;
        for envelope in &envelopes {
            let id = store.insert_received(self.phone.id, envelope)?;
            info!(uid = %envelope.uid, origin = %envelope.origin, "SMS received");

            let body = serde_json::json!({
                "id": id,
                "id_phone": self.phone.id,
                "uid": envelope.uid,
                "at": envelope.at.to_rfc3339(),
                "text": envelope.text,
                "origin": envelope.origin,
                "destination": envelope.destination,
                "flash": envelope.flash,
            })
            .to_string();
            for webhook in &webhooks {
                store.enqueue_webhook_query(&webhook.url, &body)?;
            }
        }
        Ok(envelopes.len())
    }
}

fn not_started() -> Error {
    Error::Daemon("phone worker used before on_start".to_string())
}

impl Daemon for PhoneWorker {
    fn on_start(&mut self) -> Result<()> {
        self.channel = Some(InboundChannel::open(&self.config.queue_dir, self.key)?);
        self.store = Some(Store::open(&self.config.database)?);
        self.last_activity = Instant::now();
        self.last_read = None;
        info!(number = %self.phone.number, key = %self.key, adapter = %self.adapter.adapter_id(), "Phone worker started");
        Ok(())
    }

    fn run(&mut self, control: &Control) -> Result<()> {
        if self.is_idle() {
            info!(number = %self.phone.number, "No message for {:?}, stopping", self.idle_timeout);
            control.stop();
            return Ok(());
        }

        let timeout = self.config.receive_timeout();
        let message = match &self.channel {
            Some(channel) => channel.receive(timeout)?,
            None => return Err(not_started()),
        };
        if let Some(message) = message {
            self.last_activity = Instant::now();
            debug!(key = %self.key, kind = message.kind, size = message.payload.len(), "Message received");
            self.handle(message)?;
        }

        self.read_if_due()?;
        Ok(())
    }

    fn on_stop(&mut self) -> Result<()> {
        if let Some(channel) = self.channel.take() {
            channel.destroy()?;
        }
        self.store = None;
        info!(number = %self.phone.number, "Phone worker stopped");
        Ok(())
    }
}
