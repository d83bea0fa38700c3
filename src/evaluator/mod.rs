//! Rule evaluator contract.
//!
//! The orchestrator never interprets rule text itself. It renders each rule
//! into a [`RuleDefinition`], has a [`RuleEvaluator`] compile it inside a
//! fresh [`KnowledgeScope`], and executes the result against an
//! [`EvaluationContext`] exposing `Event` and `Payload`. The evaluator
//! reports back an [`Outcome`] instead of mutating the event.

pub mod expr;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{EventEnvelope, Rule};

pub use expr::ExprEvaluator;

/// Name the whole event is bound to in rule text.
pub const EVENT_NAME: &str = "Event";
/// Name the extracted payload is bound to in rule text.
pub const PAYLOAD_NAME: &str = "Payload";

const SCOPE_PREFIX: &str = "EventRules";
const SCOPE_VERSION: &str = "0.0.1";

/// Compile and execution failures, reported distinctly.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluatorError {
    #[error("compile error: {0}")]
    Compile(String),

    #[error("execution error: {0}")]
    Execution(String),
}

/// Isolated namespace one compiled rule lives in. Never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeScope {
    pub name: String,
    pub version: String,
}

impl KnowledgeScope {
    pub fn fresh() -> Self {
        Self {
            name: format!("{SCOPE_PREFIX}-{}", Uuid::new_v4().simple()),
            version: SCOPE_VERSION.to_string(),
        }
    }
}

/// A rule rendered into evaluator source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDefinition {
    pub rule_id: String,
    pub source: String,
}

impl RuleDefinition {
    /// `rule <id> { when <condition> then <action>; }`
    pub fn render(rule: &Rule) -> Self {
        let source = format!(
            "rule {} {{\n    when\n        {}\n    then\n        {};\n}}",
            rule.id(),
            rule.condition.trim(),
            rule.action.trim()
        );
        Self {
            rule_id: rule.id().to_string(),
            source,
        }
    }
}

/// Named values a rule executes against.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationContext {
    event: serde_json::Value,
    payload: serde_json::Value,
}

impl EvaluationContext {
    pub fn new(event: &EventEnvelope) -> Self {
        let payload = event.payload.clone();
        let event = serde_json::to_value(event).unwrap_or(serde_json::Value::Null);
        Self { event, payload }
    }

    /// Look up a bound name (`Event`, `Payload`).
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        match name {
            EVENT_NAME => Some(&self.event),
            PAYLOAD_NAME => Some(&self.payload),
            _ => None,
        }
    }
}

/// What executing a rule produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// The action marked the event as handled.
    pub handled: bool,
    /// Other assignments made by the action, keyed by dotted target path.
    #[serde(default)]
    pub emitted_fields: BTreeMap<String, serde_json::Value>,
}

/// Compiles rendered rules.
#[async_trait]
pub trait RuleEvaluator: Send + Sync {
    async fn compile(
        &self,
        scope: &KnowledgeScope,
        definition: &RuleDefinition,
    ) -> Result<Box<dyn CompiledRule>, EvaluatorError>;
}

/// A rule compiled inside its own scope.
#[async_trait]
pub trait CompiledRule: Send + Sync {
    async fn execute(&self, ctx: &EvaluationContext) -> Result<Outcome, EvaluatorError>;
}

#[async_trait]
impl<E: RuleEvaluator + ?Sized> RuleEvaluator for Arc<E> {
    async fn compile(
        &self,
        scope: &KnowledgeScope,
        definition: &RuleDefinition,
    ) -> Result<Box<dyn CompiledRule>, EvaluatorError> {
        (**self).compile(scope, definition).await
    }
}
