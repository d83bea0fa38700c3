//! Event type registry.
//!
//! Maps a `type` tag to a factory producing an empty [`Evaluable`]. Raw
//! bytes are resolved by peeking at the tag, constructing the registered
//! type, and decoding the full document into it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::cancel::EvalContext;
use crate::error::{Error, Result};
use crate::event::{Event, EventPayload, Evaluable};
use crate::processor::RuleProcessor;

/// Zero-argument factory for an empty event instance.
pub type EventConstructor = Arc<dyn Fn() -> Box<dyn Evaluable> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    constructor: EventConstructor,
    fields: &'static [&'static str],
}

/// Registry of event types, indexed by tag.
///
/// Registration takes the write lock; resolution only ever reads.
#[derive(Default)]
pub struct EventRegistry {
    types: RwLock<HashMap<String, Registration>>,
}

impl EventRegistry {
    /// Create an empty registry with no event types.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tag with an arbitrary constructor. Replaces any previous
    /// registration for the same tag.
    pub fn register<F>(&self, event_type: impl Into<String>, constructor: F)
    where
        F: Fn() -> Box<dyn Evaluable> + Send + Sync + 'static,
    {
        self.insert(event_type.into(), Arc::new(constructor), &[]);
    }

    /// Register `Event<P>` under `event_type`, declaring `P::FIELDS`.
    pub fn register_payload<P: EventPayload>(&self, event_type: impl Into<String>) {
        self.insert(
            event_type.into(),
            Arc::new(|| Box::new(Event::<P>::default()) as Box<dyn Evaluable>),
            P::FIELDS,
        );
    }

    fn insert(
        &self,
        event_type: String,
        constructor: EventConstructor,
        fields: &'static [&'static str],
    ) {
        debug!(%event_type, "registering event type");
        let mut types = self.types.write().unwrap_or_else(|e| e.into_inner());
        types.insert(
            event_type,
            Registration {
                constructor,
                fields,
            },
        );
    }

    /// Declared payload fields for a type. Empty when the type declares none.
    pub fn fields(&self, event_type: &str) -> Option<&'static [&'static str]> {
        self.read().get(event_type).map(|r| r.fields)
    }

    /// Registered tags, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.read().keys().cloned().collect();
        tags.sort();
        tags
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Registration>> {
        self.types.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Decode raw bytes into the registered event type for their `type` tag.
    pub fn resolve(&self, raw: &[u8]) -> Result<Box<dyn Evaluable>> {
        let doc: serde_json::Value = serde_json::from_slice(raw).map_err(Error::MalformedInput)?;
        let event_type = doc
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(Error::MissingType)?;

        // Clone the factory out so the lock is not held while decoding.
        let constructor = self
            .read()
            .get(event_type)
            .map(|r| Arc::clone(&r.constructor))
            .ok_or_else(|| Error::UnknownEventType(event_type.to_string()))?;

        let mut instance = constructor();
        instance.populate(raw).map_err(|source| Error::PayloadDecode {
            event_type: event_type.to_string(),
            source,
        })?;
        Ok(instance)
    }

    /// Resolve raw bytes and let the event evaluate itself against `processor`.
    pub async fn resolve_and_dispatch(
        &self,
        ctx: &EvalContext,
        processor: &dyn RuleProcessor,
        raw: &[u8],
    ) -> Result<bool> {
        let mut instance = self.resolve(raw)?;
        instance.evaluate(ctx, processor).await
    }
}
