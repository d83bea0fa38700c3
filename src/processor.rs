//! Evaluation orchestrator: runs one event through its tenant's rules.
//!
//! `Validating → RuleLookup → (DedupCheck → Execute → PersistOnMatch)* → Done`.
//! The first rule whose action marks the event handled wins; later rules are
//! never looked at. Any hard failure aborts the whole call.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::{Instrument, Span, debug, info, warn};

use crate::cancel::EvalContext;
use crate::error::{Error, Result};
use crate::evaluator::{
    EvaluationContext, ExprEvaluator, KnowledgeScope, Outcome, RuleDefinition, RuleEvaluator,
};
use crate::model::{EventEnvelope, NewProcessedEvent, Rule, Stage};
use crate::rules::RuleSource;
use crate::store::{DedupQuery, EventStore, StoreSession};
use crate::telemetry::event::{record_stage, start_event_span};
use crate::telemetry::metrics;

/// Anything that can decide whether an event is handled.
#[async_trait]
pub trait RuleProcessor: Send + Sync {
    /// `Ok(true)` when a rule fired and its record was persisted.
    async fn evaluate(&self, ctx: &EvalContext, event: EventEnvelope) -> Result<bool>;
}

/// The default [`RuleProcessor`]: rules from a [`RuleSource`], dedup and
/// audit through an [`EventStore`], rule text through a [`RuleEvaluator`].
#[derive(Clone)]
pub struct Orchestrator {
    rules: Arc<RuleSource>,
    store: Arc<dyn EventStore>,
    evaluator: Arc<dyn RuleEvaluator>,
}

impl Orchestrator {
    pub fn new(
        rules: Arc<RuleSource>,
        store: Arc<dyn EventStore>,
        evaluator: Arc<dyn RuleEvaluator>,
    ) -> Self {
        Self {
            rules,
            store,
            evaluator,
        }
    }

    /// Orchestrator using the built-in expression evaluator.
    pub fn with_builtin_evaluator(rules: Arc<RuleSource>, store: Arc<dyn EventStore>) -> Self {
        Self::new(rules, store, Arc::new(ExprEvaluator))
    }

    pub fn rules(&self) -> &Arc<RuleSource> {
        &self.rules
    }

    async fn run(&self, ctx: &EvalContext, event: &EventEnvelope, span: &Span) -> Result<bool> {
        // The registry has already decoded the event.
        let mut stage = StageTracker::new(span, Stage::Decoding);

        stage.enter(Stage::Validating);
        event.validate()?;
        ctx.check(Stage::Validating)?;

        stage.enter(Stage::RuleLookup);
        let repo = ctx.guard(Stage::RuleLookup, self.rules.get()).await?;
        let rules = repo.get_rules(&event.tenant_id, &event.event_type);
        if rules.is_empty() {
            debug!("no rules for event");
            stage.enter(Stage::Done);
            return Ok(false);
        }

        // Held until this call returns, whichever way it returns.
        let mut session = ctx
            .guard(Stage::RuleLookup, async {
                self.store
                    .acquire()
                    .await
                    .map_err(|e| Error::SessionUnavailable {
                        source: Box::new(e),
                    })
            })
            .await?;

        for rule in rules {
            let rule_id = rule.id();
            span.record("event.rule", rule_id);
            let labels = [
                KeyValue::new("event_type", event.event_type.clone()),
                KeyValue::new("rule_id", rule_id.to_string()),
            ];

            if rule.deduplication {
                stage.enter(Stage::DedupCheck);
                if self.is_duplicate(ctx, session.as_mut(), event, rule).await? {
                    debug!(
                        rule_id,
                        window = ?rule.dedup_window,
                        "duplicate within window, skipping rule"
                    );
                    metrics::rules_deduplicated().add(1, &labels);
                    continue;
                }
            }

            stage.enter(Stage::Execute);
            let outcome = ctx
                .guard(Stage::Execute, self.execute_rule(rule, event))
                .await?;
            metrics::rules_evaluated().add(1, &labels);

            if !outcome.handled {
                if !outcome.emitted_fields.is_empty() {
                    debug!(
                        rule_id,
                        fields = ?outcome.emitted_fields,
                        "rule emitted fields without handling"
                    );
                }
                continue;
            }

            stage.enter(Stage::PersistOnMatch);
            let persist_err = |e: Error| Error::Persistence {
                rule_id: rule_id.to_string(),
                source: Box::new(e),
            };
            let record = NewProcessedEvent::from_envelope(event, rule_id).map_err(persist_err)?;
            let saved = ctx
                .guard(Stage::PersistOnMatch, async {
                    if rule.deduplication {
                        session
                            .save_unless_duplicate(&record, rule.dedup_window)
                            .await
                            .map_err(persist_err)
                    } else {
                        session.save(&record).await.map_err(persist_err).map(|()| true)
                    }
                })
                .await?;
            if !saved {
                // A concurrent evaluation recorded the same firing first.
                debug!(rule_id, "duplicate recorded concurrently, skipping rule");
                metrics::rules_deduplicated().add(1, &labels);
                continue;
            }

            info!(rule_id, send_email = rule.send_email, "event handled");
            stage.enter(Stage::Done);
            return Ok(true);
        }

        stage.enter(Stage::Done);
        Ok(false)
    }

    async fn is_duplicate(
        &self,
        ctx: &EvalContext,
        session: &mut dyn StoreSession,
        event: &EventEnvelope,
        rule: &Rule,
    ) -> Result<bool> {
        let query = DedupQuery {
            tenant_id: &event.tenant_id,
            event_type: &event.event_type,
            rule_id: rule.id(),
            event_sha: &event.event_sha,
            window: rule.dedup_window,
        };
        ctx.guard(Stage::DedupCheck, async {
            session
                .is_duplicate(query)
                .await
                .map_err(|e| Error::DuplicateCheckFailed {
                    rule_id: rule.id().to_string(),
                    source: Box::new(e),
                })
        })
        .await
    }

    /// Compile the rule into its own scope and run it once.
    async fn execute_rule(&self, rule: &Rule, event: &EventEnvelope) -> Result<Outcome> {
        let definition = RuleDefinition::render(rule);
        let scope = KnowledgeScope::fresh();
        let context = EvaluationContext::new(event);
        let exec_err = |source| Error::RuleExecution {
            rule_id: rule.id().to_string(),
            source,
        };

        let compiled = self
            .evaluator
            .compile(&scope, &definition)
            .await
            .map_err(exec_err)?;
        compiled.execute(&context).await.map_err(exec_err)
    }
}

/// Walks the evaluation state machine, recording each stage on the span.
struct StageTracker<'a> {
    span: &'a Span,
    current: Stage,
}

impl<'a> StageTracker<'a> {
    fn new(span: &'a Span, start: Stage) -> Self {
        Self {
            span,
            current: start,
        }
    }

    fn enter(&mut self, next: Stage) {
        debug_assert!(
            self.current.can_transition_to(next),
            "illegal stage transition {} -> {next}",
            self.current
        );
        record_stage(self.span, next);
        self.current = next;
    }
}

#[async_trait]
impl RuleProcessor for Orchestrator {
    async fn evaluate(&self, ctx: &EvalContext, event: EventEnvelope) -> Result<bool> {
        let span = start_event_span(&event.event_type, &event.tenant_id);
        span.record("event.sha", event.event_sha.as_str());
        let started = Instant::now();

        let result = self
            .run(ctx, &event, &span)
            .instrument(span.clone())
            .await;

        let label = match &result {
            Ok(true) => "handled",
            Ok(false) => "unhandled",
            Err(_) => "error",
        };
        metrics::events_processed().add(
            1,
            &[
                KeyValue::new("event_type", event.event_type.clone()),
                KeyValue::new("result", label),
            ],
        );
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "evaluate")],
        );
        if let Err(e) = &result {
            span.in_scope(|| warn!(stage = %e.stage(), error = %e, "evaluation failed"));
        }
        result
    }
}

#[async_trait]
impl<P: RuleProcessor + ?Sized> RuleProcessor for Arc<P> {
    async fn evaluate(&self, ctx: &EvalContext, event: EventEnvelope) -> Result<bool> {
        (**self).evaluate(ctx, event).await
    }
}
