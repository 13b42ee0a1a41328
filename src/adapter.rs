//! Adapter contract
//!
//! An adapter connects one phone number to a transport: a provider API, a
//! modem, or the filesystem harness in [`crate::test_adapter`]. Workers only
//! ever see `Box<dyn Adapter>`; which variant sits behind it is decided by the
//! registry from the phone's configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

/// Delivery state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    #[default]
    Unknown,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Unknown => "unknown",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "delivered" => DeliveryStatus::Delivered,
            "failed" => DeliveryStatus::Failed,
            _ => DeliveryStatus::Unknown,
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One SMS as produced by `send` or `read`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsEnvelope {
    pub uid: String,
    pub text: String,
    pub origin: String,
    pub destination: String,
    pub at: DateTime<Utc>,
    pub flash: bool,
    pub status: DeliveryStatus,
}

/// Explicit failure of a transport operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFailure {
    pub reason: String,
}

impl SendFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for SendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "send failed: {}", self.reason)
    }
}

/// One entry of an adapter's configuration schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub name: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub required: bool,
}

/// Configuration handed to an adapter constructor
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterConfig {
    pub number: String,
    pub adapter: String,
    pub datas: serde_json::Map<String, serde_json::Value>,
}

impl AdapterConfig {
    /// String value of a configuration field
    pub fn field(&self, name: &str) -> Option<&str> {
        self.datas.get(name).and_then(|v| v.as_str())
    }
}

/// Parameters of a delivery notification, e.g. a callback's query string
pub type CallbackParams = HashMap<String, String>;

/// Translated delivery notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub uid: String,
    pub status: DeliveryStatus,
}

/// Capabilities every transport provides.
///
/// Implementations catch their own transport errors and report them through
/// the return values: `Err(SendFailure)`, an empty `Vec`, or `false`.
pub trait Adapter: Send {
    /// Send `text` to `destination`, returning the transport's message uid
    fn send(&mut self, destination: &str, text: &str, flash: bool) -> Result<String, SendFailure>;

    /// Messages received since the last call
    fn read(&mut self) -> Vec<SmsEnvelope>;

    /// Whether credentials and line look usable
    fn test(&mut self) -> bool;
}

/// Fault boundary around an adapter.
///
/// A panicking adapter is reported the same way as a failing one.
pub struct AdapterHandle {
    adapter_id: String,
    inner: Box<dyn Adapter>,
}

impl AdapterHandle {
    pub fn new(adapter_id: impl Into<String>, inner: Box<dyn Adapter>) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            inner,
        }
    }

    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    pub fn send(&mut self, destination: &str, text: &str, flash: bool) -> Result<String, SendFailure> {
        let inner = &mut self.inner;
        match catch_unwind(AssertUnwindSafe(|| inner.send(destination, text, flash))) {
            Ok(result) => result,
            Err(_) => {
                error!(adapter = %self.adapter_id, "Adapter panicked in send");
                Err(SendFailure::new("adapter panicked"))
            }
        }
    }

    pub fn read(&mut self) -> Vec<SmsEnvelope> {
        let inner = &mut self.inner;
        match catch_unwind(AssertUnwindSafe(|| inner.read())) {
            Ok(envelopes) => envelopes,
            Err(_) => {
                error!(adapter = %self.adapter_id, "Adapter panicked in read");
                Vec::new()
            }
        }
    }

    pub fn test(&mut self) -> bool {
        let inner = &mut self.inner;
        match catch_unwind(AssertUnwindSafe(|| inner.test())) {
            Ok(ok) => ok,
            Err(_) => {
                error!(adapter = %self.adapter_id, "Adapter panicked in test");
                false
            }
        }
    }
}
