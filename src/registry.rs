//! Adapter registry - maps adapter identifiers to descriptors and constructors

use crate::adapter::{Adapter, AdapterConfig, AdapterHandle, CallbackParams, FieldSpec, StatusUpdate};
use crate::error::{Error, Result};
use crate::store::Store;
use crate::test_adapter;
use serde::Serialize;
use std::collections::BTreeMap;

pub type BuildFn = fn(&AdapterConfig) -> Result<Box<dyn Adapter>>;
pub type StatusCallbackFn = fn(&CallbackParams) -> Option<StatusUpdate>;

/// Static metadata and constructor of one adapter
#[derive(Clone, Serialize)]
pub struct AdapterDescriptor {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub fields: &'static [FieldSpec],
    pub support_flash: bool,
    pub support_status_change: bool,
    #[serde(skip)]
    pub build: BuildFn,
    #[serde(skip)]
    pub status_change_callback: Option<StatusCallbackFn>,
}

impl std::fmt::Debug for AdapterDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl AdapterDescriptor {
    /// Check a configuration blob against the field schema
    pub fn validate(&self, datas: &serde_json::Value) -> Result<serde_json::Map<String, serde_json::Value>> {
        let object = datas.as_object().ok_or_else(|| {
            Error::Config(format!("{} configuration must be a JSON object", self.id))
        })?;

        let missing: Vec<&str> = self
            .fields
            .iter()
            .filter(|field| field.required)
            .filter(|field| {
                object
                    .get(field.name)
                    .and_then(|v| v.as_str())
                    .map(|s| s.trim().is_empty())
                    .unwrap_or(true)
            })
            .map(|field| field.name)
            .collect();

        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "{} configuration is missing required fields: {}",
                self.id,
                missing.join(", ")
            )));
        }

        Ok(object.clone())
    }
}

/// Known adapters, keyed by identifier
pub struct AdapterRegistry {
    descriptors: BTreeMap<&'static str, AdapterDescriptor>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            descriptors: BTreeMap::new(),
        }
    }

    /// Registry holding every adapter shipped with the crate
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(AdapterDescriptor {
            id: test_adapter::ID,
            name: test_adapter::NAME,
            description: test_adapter::DESCRIPTION,
            fields: test_adapter::FIELDS,
            support_flash: true,
            support_status_change: true,
            build: test_adapter::TestAdapter::build,
            status_change_callback: Some(test_adapter::status_change_callback),
        });
        registry
    }

    /// Register or replace an adapter
    pub fn register(&mut self, descriptor: AdapterDescriptor) {
        self.descriptors.insert(descriptor.id, descriptor);
    }

    pub fn get(&self, id: &str) -> Option<&AdapterDescriptor> {
        self.descriptors.get(id)
    }

    pub fn all(&self) -> impl Iterator<Item = &AdapterDescriptor> {
        self.descriptors.values()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Validate `datas` (a JSON string) and build the adapter for `number`
    pub fn construct(&self, id: &str, number: &str, datas: &str) -> Result<AdapterHandle> {
        let descriptor = self
            .get(id)
            .ok_or_else(|| Error::UnknownAdapter(id.to_string()))?;

        let value: serde_json::Value = if datas.trim().is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(datas)
                .map_err(|e| Error::Config(format!("{} configuration is not valid JSON: {}", id, e)))?
        };
        let datas = descriptor.validate(&value)?;

        let config = AdapterConfig {
            number: number.to_string(),
            adapter: id.to_string(),
            datas,
        };
        let adapter = (descriptor.build)(&config)?;
        Ok(AdapterHandle::new(descriptor.id, adapter))
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Translate a delivery notification for `adapter_id` and record it on the
/// matching sent message. Returns `None` when the adapter has no callback or
/// the notification could not be understood.
pub fn apply_status_change(
    store: &Store,
    registry: &AdapterRegistry,
    adapter_id: &str,
    params: &CallbackParams,
) -> Result<Option<StatusUpdate>> {
    let descriptor = registry
        .get(adapter_id)
        .ok_or_else(|| Error::UnknownAdapter(adapter_id.to_string()))?;

    let callback = match descriptor.status_change_callback {
        Some(callback) => callback,
        None => return Ok(None),
    };
    let update = match callback(params) {
        Some(update) => update,
        None => return Ok(None),
    };

    let updated = store.update_sended_status(&update.uid, update.status)?;
    if updated == 0 {
        tracing::warn!(uid = %update.uid, "Delivery report for unknown message");
    }
    Ok(Some(update))
}
