//! Error types for eventgate.
//!
//! Every failure carries enough context to tell which pipeline stage
//! produced it; see [`Error::stage`].

use thiserror::Error;

use crate::evaluator::EvaluatorError;
use crate::model::Stage;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed event input: {0}")]
    MalformedInput(#[source] serde_json::Error),

    #[error("missing or invalid event type")]
    MissingType,

    #[error("event type '{0}' not registered")]
    UnknownEventType(String),

    #[error("failed to decode payload for event type '{event_type}': {source}")]
    PayloadDecode {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("cannot fingerprint an empty deduplication key")]
    EmptyDedupKey,

    #[error("failed to load rules from {path}: {reason}")]
    RuleLoad { path: String, reason: String },

    #[error("rule validation failed: tenant {tenant_id}, rule {rule_id}: {reason}")]
    RuleValidation {
        tenant_id: String,
        rule_id: String,
        reason: String,
    },

    #[error("could not open a store session: {source}")]
    SessionUnavailable {
        #[source]
        source: Box<Error>,
    },

    #[error("duplicate check failed for rule {rule_id}: {source}")]
    DuplicateCheckFailed {
        rule_id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("rule {rule_id} failed: {source}")]
    RuleExecution {
        rule_id: String,
        #[source]
        source: EvaluatorError,
    },

    #[error("failed to persist processed event for rule {rule_id}: {source}")]
    Persistence {
        rule_id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("evaluation cancelled during {stage}")]
    Cancelled { stage: Stage },

    #[error("deadline exceeded during {stage}")]
    DeadlineExceeded { stage: Stage },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The pipeline stage this error surfaced in.
    ///
    /// Ambient errors (config, raw database or io failures outside the
    /// pipeline) report [`Stage::Setup`].
    pub fn stage(&self) -> Stage {
        match self {
            Error::MalformedInput(_)
            | Error::MissingType
            | Error::UnknownEventType(_)
            | Error::PayloadDecode { .. } => Stage::Decoding,
            Error::InvalidEvent(_) | Error::EmptyDedupKey => Stage::Validating,
            Error::RuleLoad { .. }
            | Error::RuleValidation { .. }
            | Error::SessionUnavailable { .. } => Stage::RuleLookup,
            Error::DuplicateCheckFailed { .. } => Stage::DedupCheck,
            Error::RuleExecution { .. } => Stage::Execute,
            Error::Persistence { .. } => Stage::PersistOnMatch,
            Error::Cancelled { stage } | Error::DeadlineExceeded { stage } => *stage,
            Error::Config(_) | Error::Database(_) | Error::Io(_) | Error::Other(_) => {
                Stage::Setup
            }
        }
    }

    /// Whether the call was aborted by its cancellation token or deadline.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled { .. } | Error::DeadlineExceeded { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
