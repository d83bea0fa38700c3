//! Typed events and the capability every event type exposes.
//!
//! An event type is a payload struct implementing [`EventPayload`]. The
//! generic [`Event<P>`] wraps it with the tenant-scoped envelope fields and
//! implements [`Evaluable`], the object-safe interface the registry hands
//! out: populate from raw JSON, validate, fingerprint, evaluate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cancel::EvalContext;
use crate::error::{Error, Result};
use crate::model::EventEnvelope;
use crate::processor::RuleProcessor;

/// Compute the fingerprint of a deduplication key: hex SHA-256, 64 chars.
pub fn compute_fingerprint(dedup_key: &str) -> Result<String> {
    if dedup_key.is_empty() {
        return Err(Error::EmptyDedupKey);
    }
    Ok(hex::encode(Sha256::digest(dedup_key.as_bytes())))
}

/// Per-type policy: what the payload looks like, what makes it valid, and
/// which fields define its identity.
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Field names rules may reference in `payload_fields`.
    const FIELDS: &'static [&'static str] = &[];

    /// Type-specific constraints. The message names the first failing one.
    fn validate(&self) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Delimiter-joined identity fields. An empty key cannot be fingerprinted.
    fn dedup_key(&self) -> String;

    /// The payload as rules see it. Must be a JSON object.
    fn to_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self)
            .map_err(|e| Error::InvalidEvent(format!("payload is not serializable: {e}")))
    }
}

/// Payload carried as a JSON document inside a string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawJson(pub String);

impl RawJson {
    fn parse(&self) -> std::result::Result<serde_json::Value, String> {
        match serde_json::from_str::<serde_json::Value>(&self.0) {
            Ok(v) if v.is_object() => Ok(v),
            Ok(_) => Err("payload string must hold a JSON object".to_string()),
            Err(e) => Err(format!("payload string is not valid JSON: {e}")),
        }
    }
}

impl EventPayload for RawJson {
    fn validate(&self) -> std::result::Result<(), String> {
        self.parse().map(|_| ())
    }

    /// The whole document, canonicalized, is the identity.
    fn dedup_key(&self) -> String {
        self.parse()
            .ok()
            .and_then(|v| serde_json::to_string(&v).ok())
            .unwrap_or_default()
    }

    fn to_value(&self) -> Result<serde_json::Value> {
        self.parse().map_err(Error::InvalidEvent)
    }
}

/// A tenant-scoped event with a typed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<P> {
    #[serde(default)]
    pub tenant_id: String,

    #[serde(default, rename = "type")]
    pub event_type: String,

    pub payload: Option<P>,

    /// Outcome of evaluation. Ignored on input.
    #[serde(default, skip_deserializing)]
    pub should_handle: bool,

    /// Computed from the dedup key. Ignored on input.
    #[serde(default, skip_deserializing)]
    pub event_sha: String,

    #[serde(default, alias = "ocured_at")]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl<P> Default for Event<P> {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            event_type: String::new(),
            payload: None,
            should_handle: false,
            event_sha: String::new(),
            occurred_at: None,
        }
    }
}

impl<P: EventPayload> Event<P> {
    pub fn new(tenant_id: impl Into<String>, event_type: impl Into<String>, payload: P) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            event_type: event_type.into(),
            payload: Some(payload),
            ..Self::default()
        }
    }

    /// Erase the concrete type. Requires a computed fingerprint.
    pub fn to_envelope(&self) -> Result<EventEnvelope> {
        let payload = self
            .payload
            .as_ref()
            .ok_or_else(|| Error::InvalidEvent("payload is missing".into()))?
            .to_value()?;
        Ok(EventEnvelope {
            tenant_id: self.tenant_id.clone(),
            event_type: self.event_type.clone(),
            payload,
            should_handle: self.should_handle,
            event_sha: self.event_sha.clone(),
            occurred_at: self.occurred_at,
        })
    }
}

/// What the registry constructs: a populated, self-evaluating event.
#[async_trait]
pub trait Evaluable: Send + Sync {
    /// Replace this instance's contents with the decoded document.
    fn populate(&mut self, raw: &[u8]) -> std::result::Result<(), serde_json::Error>;

    fn validate(&self) -> Result<()>;

    fn fingerprint_key(&self) -> String;

    /// Validate, fingerprint, and hand the erased event to `processor`.
    async fn evaluate(
        &mut self,
        ctx: &EvalContext,
        processor: &dyn RuleProcessor,
    ) -> Result<bool>;
}

#[async_trait]
impl<P: EventPayload> Evaluable for Event<P> {
    fn populate(&mut self, raw: &[u8]) -> std::result::Result<(), serde_json::Error> {
        *self = serde_json::from_slice(raw)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(Error::InvalidEvent("tenant_id cannot be empty".into()));
        }
        if self.event_type.trim().is_empty() {
            return Err(Error::InvalidEvent("type cannot be empty".into()));
        }
        let payload = self
            .payload
            .as_ref()
            .ok_or_else(|| Error::InvalidEvent("payload is missing".into()))?;
        payload.validate().map_err(Error::InvalidEvent)
    }

    fn fingerprint_key(&self) -> String {
        self.payload
            .as_ref()
            .map(EventPayload::dedup_key)
            .unwrap_or_default()
    }

    async fn evaluate(
        &mut self,
        ctx: &EvalContext,
        processor: &dyn RuleProcessor,
    ) -> Result<bool> {
        Evaluable::validate(self)?;
        self.event_sha = compute_fingerprint(&self.fingerprint_key())?;
        let envelope = self.to_envelope()?;
        let handled = processor.evaluate(ctx, envelope).await?;
        self.should_handle = handled;
        Ok(handled)
    }
}
