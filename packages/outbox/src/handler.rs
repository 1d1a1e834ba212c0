//! Handler registration and the default payload serializer.
//!
//! Mirrors the registry-by-name pattern this codebase already uses for
//! lifecycle-managed services, but keyed by `handler_id` and holding
//! record handlers instead: a `DashMap<String, Arc<dyn RecordHandler>>`
//! plus an optional per-handler retry policy override.

use std::sync::Arc;

use dashmap::DashMap;
use outbox_core::{OutboxError, PayloadSerializer, RecordHandler, RetryPolicy};

/// Maps `handler_id` to the user-provided handler (and, optionally, a
/// retry policy that overrides the instance-wide default for that handler).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn RecordHandler>>,
    overrides: DashMap<String, Arc<dyn RetryPolicy>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler_id: impl Into<String>, handler: Arc<dyn RecordHandler>) {
        self.handlers.insert(handler_id.into(), handler);
    }

    pub fn register_with_retry_policy(
        &self,
        handler_id: impl Into<String>,
        handler: Arc<dyn RecordHandler>,
        retry_policy: Arc<dyn RetryPolicy>,
    ) {
        let handler_id = handler_id.into();
        self.overrides.insert(handler_id.clone(), retry_policy);
        self.handlers.insert(handler_id, handler);
    }

    /// Looks up the handler for `handler_id`, surfacing
    /// [`OutboxError::Configuration`] when none was registered -- a
    /// `handlerId` with no handler is a configuration defect, not a
    /// transient failure.
    pub fn get(&self, handler_id: &str) -> Result<Arc<dyn RecordHandler>, OutboxError> {
        self.handlers
            .get(handler_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| OutboxError::Configuration(format!("no handler registered for handler_id {handler_id}")))
    }

    #[must_use]
    pub fn retry_policy_override(&self, handler_id: &str) -> Option<Arc<dyn RetryPolicy>> {
        self.overrides.get(handler_id).map(|entry| Arc::clone(entry.value()))
    }
}

/// Default [`PayloadSerializer`] backed by `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPayloadSerializer;

impl PayloadSerializer for JsonPayloadSerializer {
    fn serialize(&self, value: &serde_json::Value) -> outbox_core::Result<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| OutboxError::Configuration(format!("failed to serialize payload: {e}")))
    }

    fn deserialize(&self, bytes: &[u8], _type_hint: &str) -> outbox_core::Result<serde_json::Value> {
        serde_json::from_slice(bytes)
            .map_err(|e| OutboxError::Configuration(format!("failed to deserialize payload: {e}")))
    }
}
