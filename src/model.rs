//! Core data model.
//!
//! An event enters as raw bytes, is resolved to a concrete type, and is then
//! handed to the orchestrator as an [`EventEnvelope`]: the type-erased shape
//! every event type reduces to. A rule that fires leaves a [`ProcessedEvent`]
//! behind for audit and later deduplication.

pub mod rule;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use rule::Rule;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Position in the evaluation state machine.
///
/// `Validating → RuleLookup → (DedupCheck → Execute → PersistOnMatch)* → Done`.
/// `Setup` and `Decoding` precede the per-event machine proper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Startup, configuration, connection management.
    Setup,
    /// Raw bytes being resolved into a registered event type.
    Decoding,
    Validating,
    RuleLookup,
    DedupCheck,
    Execute,
    PersistOnMatch,
    Done,
}

impl Stage {
    /// Can the machine move from self to `to`?
    pub fn can_transition_to(self, to: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, to),
            (Setup, Decoding)
                | (Decoding, Validating)
                | (Validating, RuleLookup)
                | (RuleLookup, DedupCheck)
                | (RuleLookup, Execute)         // rule without dedup
                | (RuleLookup, Done)            // no rules
                | (DedupCheck, Execute)
                | (DedupCheck, DedupCheck)      // duplicate, next rule
                | (DedupCheck, Done)            // last rule was a duplicate
                | (Execute, PersistOnMatch)
                | (Execute, DedupCheck)         // not handled, next rule
                | (Execute, Execute)            // not handled, next rule without dedup
                | (Execute, Done)
                | (PersistOnMatch, Done)
                | (PersistOnMatch, DedupCheck)  // lost a concurrent dedup race
                | (PersistOnMatch, Execute)
        )
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Setup => "setup",
            Stage::Decoding => "decoding",
            Stage::Validating => "validating",
            Stage::RuleLookup => "rule_lookup",
            Stage::DedupCheck => "dedup_check",
            Stage::Execute => "execute",
            Stage::PersistOnMatch => "persist_on_match",
            Stage::Done => "done",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Event envelope
// ---------------------------------------------------------------------------

/// The common shape of every event once its concrete type has done its part
/// (validation, fingerprinting). This is what rules see as `Event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub tenant_id: String,

    #[serde(rename = "type")]
    pub event_type: String,

    /// Extracted payload. Always a JSON object once validated.
    pub payload: serde_json::Value,

    /// Outcome flag. Set from the evaluator's outcome, never trusted from input.
    #[serde(default)]
    pub should_handle: bool,

    /// Lowercase hex SHA-256 of the event's dedup key. Empty until computed.
    #[serde(default)]
    pub event_sha: String,

    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl EventEnvelope {
    /// Check the invariants every event type shares.
    ///
    /// Type-specific constraints are enforced by the concrete event before it
    /// is erased into an envelope.
    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(Error::InvalidEvent("tenant_id cannot be empty".into()));
        }
        if self.event_type.trim().is_empty() {
            return Err(Error::InvalidEvent("type cannot be empty".into()));
        }
        if !self.payload.is_object() {
            return Err(Error::InvalidEvent(
                "payload must be a structured object or a JSON object string".into(),
            ));
        }
        if self.event_sha.is_empty() {
            return Err(Error::InvalidEvent("event fingerprint has not been computed".into()));
        }
        Ok(())
    }

    /// Canonical JSON for the payload: compact, keys in sorted order.
    pub fn canonical_payload(&self) -> Result<String> {
        serde_json::to_string(&self.payload)
            .map_err(|e| Error::Other(format!("failed to serialize payload: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Processed event
// ---------------------------------------------------------------------------

/// Audit record written when a rule matched and marked the event handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcessedEvent {
    pub id: i64,
    pub tenant_id: String,
    pub event_type: String,
    pub rule_id: String,
    pub event_sha: String,
    pub event_details: serde_json::Value,
    pub occurred_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a [`ProcessedEvent`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewProcessedEvent {
    pub tenant_id: String,
    pub event_type: String,
    pub rule_id: String,
    pub event_sha: String,
    /// Canonical JSON string of the payload.
    pub event_details: String,
    pub occurred_at: Option<DateTime<Utc>>,
}

impl NewProcessedEvent {
    pub fn from_envelope(event: &EventEnvelope, rule_id: &str) -> Result<Self> {
        Ok(Self {
            tenant_id: event.tenant_id.clone(),
            event_type: event.event_type.clone(),
            rule_id: rule_id.to_string(),
            event_sha: event.event_sha.clone(),
            event_details: event.canonical_payload()?,
            occurred_at: event.occurred_at,
        })
    }
}
