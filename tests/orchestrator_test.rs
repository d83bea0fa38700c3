//! End-to-end evaluation through the registry, orchestrator and in-memory store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use eventgate::cancel::EvalContext;
use eventgate::error::Error;
use eventgate::evaluator::{
    CompiledRule, EvaluatorError, ExprEvaluator, KnowledgeScope, RuleDefinition, RuleEvaluator,
};
use eventgate::event::RawJson;
use eventgate::events;
use eventgate::model::{NewProcessedEvent, Stage};
use eventgate::processor::Orchestrator;
use eventgate::registry::EventRegistry;
use eventgate::rules::{RuleRepository, RuleSource};
use eventgate::store::MemoryEventStore;
use eventgate::store::memory::StoreOp;
use serde_json::json;
use sha2::{Digest, Sha256};

/// Built-in evaluator that remembers every compile it was asked for.
#[derive(Default)]
struct Recording {
    compiled: Mutex<Vec<(String, String)>>,
}

impl Recording {
    fn rule_ids(&self) -> Vec<String> {
        self.compiled
            .lock()
            .unwrap()
            .iter()
            .map(|(_, id)| id.clone())
            .collect()
    }

    fn scopes(&self) -> Vec<String> {
        self.compiled
            .lock()
            .unwrap()
            .iter()
            .map(|(scope, _)| scope.clone())
            .collect()
    }
}

#[async_trait]
impl RuleEvaluator for Recording {
    async fn compile(
        &self,
        scope: &KnowledgeScope,
        definition: &RuleDefinition,
    ) -> Result<Box<dyn CompiledRule>, EvaluatorError> {
        self.compiled
            .lock()
            .unwrap()
            .push((scope.name.clone(), definition.rule_id.clone()));
        ExprEvaluator.compile(scope, definition).await
    }
}

struct Harness {
    registry: EventRegistry,
    orchestrator: Orchestrator,
    store: MemoryEventStore,
    evaluator: Arc<Recording>,
}

impl Harness {
    fn new(doc: &str) -> Self {
        Self::with_evaluator(doc, None)
    }

    fn with_evaluator(doc: &str, evaluator: Option<Arc<dyn RuleEvaluator>>) -> Self {
        let registry = EventRegistry::new();
        events::register_builtin(&registry);
        let repo = RuleRepository::from_json(doc, "test", "default").unwrap();
        let store = MemoryEventStore::new();
        let recording = Arc::new(Recording::default());
        let evaluator: Arc<dyn RuleEvaluator> = match evaluator {
            Some(evaluator) => evaluator,
            None => recording.clone(),
        };
        let orchestrator = Orchestrator::new(
            Arc::new(RuleSource::from_repository(repo)),
            Arc::new(store.clone()),
            evaluator,
        );
        Self {
            registry,
            orchestrator,
            store,
            evaluator: recording,
        }
    }

    async fn dispatch(&self, raw: &str) -> eventgate::Result<bool> {
        self.dispatch_with(&EvalContext::background(), raw).await
    }

    async fn dispatch_with(&self, ctx: &EvalContext, raw: &str) -> eventgate::Result<bool> {
        self.registry
            .resolve_and_dispatch(ctx, &self.orchestrator, raw.as_bytes())
            .await
    }
}

fn disk(tenant: &str, usage: i64, instance: &str) -> String {
    json!({
        "type": "disk_space",
        "tenant_id": tenant,
        "payload": {
            "usage_percentage": usage,
            "instance_id": instance,
            "disk_size_in_bytes": 2048
        }
    })
    .to_string()
}

const HIGH_DISK: &str = r#"{
    "t1": {
        "disk_space": [
            {"rule_id": "high_disk", "condition": "Payload.usage_percentage > 75", "action": "Event.should_handle = true"}
        ]
    }
}"#;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disk_scenario_persists_one_fingerprinted_record() {
    let h = Harness::new(HIGH_DISK);

    assert!(h.dispatch(&disk("t1", 80, "abcd")).await.unwrap());

    let records = h.store.records();
    assert_eq!(records.len(), 1);
    let expected = hex::encode(Sha256::digest(b"80|abcd"));
    assert_eq!(records[0].event_sha, expected);
    assert_eq!(records[0].tenant_id, "t1");
    assert_eq!(records[0].event_type, "disk_space");
    assert_eq!(records[0].rule_id, "high_disk");
    assert_eq!(records[0].event_details["instance_id"], "abcd");
    assert_eq!(h.store.open_sessions(), 0);
}

#[tokio::test]
async fn no_matching_rules_is_unhandled_without_writes() {
    let h = Harness::new(
        r#"{"t1": {"cpu_load": [
            {"rule_id": "cpu", "condition": "true", "action": "Event.should_handle = true"}
        ]}}"#,
    );

    assert!(!h.dispatch(&disk("t1", 80, "abcd")).await.unwrap());
    assert!(h.store.records().is_empty());
    assert_eq!(h.store.sessions_acquired(), 0);
    assert!(h.evaluator.rule_ids().is_empty());
}

#[tokio::test]
async fn condition_false_is_unhandled() {
    let h = Harness::new(HIGH_DISK);
    assert!(!h.dispatch(&disk("t1", 40, "abcd")).await.unwrap());
    assert!(h.store.records().is_empty());
    assert_eq!(h.evaluator.rule_ids(), vec!["high_disk"]);
}

#[tokio::test]
async fn emitted_fields_alone_do_not_handle() {
    let h = Harness::new(
        r#"{"t1": {"disk_space": [
            {"rule_id": "tag", "condition": "true", "action": "Event.severity = \"high\""}
        ]}}"#,
    );
    assert!(!h.dispatch(&disk("t1", 80, "abcd")).await.unwrap());
    assert!(h.store.records().is_empty());
}

// ---------------------------------------------------------------------------
// Default tenant fallback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_tenant_uses_default_rules() {
    let h = Harness::new(
        r#"{"default": {"disk_space": [
            {"rule_id": "fallback", "condition": "Payload.usage_percentage > 75", "action": "Event.should_handle = true"}
        ]}}"#,
    );

    assert!(h.dispatch(&disk("t9", 80, "abcd")).await.unwrap());
    let records = h.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tenant_id, "t9");
    assert_eq!(records[0].rule_id, "fallback");
}

#[tokio::test]
async fn known_tenant_without_rules_for_type_does_not_fall_back() {
    let h = Harness::new(
        r#"{
            "t1": {"cpu_load": []},
            "default": {"disk_space": [
                {"rule_id": "fallback", "condition": "true", "action": "Event.should_handle = true"}
            ]}
        }"#,
    );

    assert!(!h.dispatch(&disk("t1", 80, "abcd")).await.unwrap());
    assert!(h.evaluator.rule_ids().is_empty());
}

// ---------------------------------------------------------------------------
// Ordering and deduplication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_match_wins() {
    let h = Harness::new(
        r#"{"t1": [
            {"rule_id": "quiet", "event_type": "disk_space", "condition": "Payload.usage_percentage > 95", "action": "Event.should_handle = true"},
            {"rule_id": "first", "event_type": "disk_space", "condition": "Payload.usage_percentage > 75", "action": "Event.should_handle = true"},
            {"rule_id": "second", "event_type": "disk_space", "condition": "Payload.usage_percentage > 50", "action": "Event.should_handle = true"}
        ]}"#,
    );

    assert!(h.dispatch(&disk("t1", 80, "abcd")).await.unwrap());
    let records = h.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].rule_id, "first");
    assert_eq!(h.evaluator.rule_ids(), vec!["quiet", "first"]);
}

#[tokio::test]
async fn duplicate_within_window_is_suppressed() {
    let h = Harness::new(
        r#"{"t1": {"disk_space": [
            {"rule_id": "high_disk", "condition": "Payload.usage_percentage > 75", "action": "Event.should_handle = true",
             "deduplication": true, "dedup_window": "1h"}
        ]}}"#,
    );
    let raw = disk("t1", 80, "abcd");

    assert!(h.dispatch(&raw).await.unwrap());
    assert!(!h.dispatch(&raw).await.unwrap());

    assert_eq!(h.store.records().len(), 1);
    // The second call never re-ran the rule.
    assert_eq!(h.evaluator.rule_ids(), vec!["high_disk"]);

    // A different fingerprint is not a duplicate.
    assert!(h.dispatch(&disk("t1", 81, "abcd")).await.unwrap());
    assert_eq!(h.store.records().len(), 2);
}

#[tokio::test]
async fn duplicate_outside_window_fires_again() {
    let h = Harness::new(
        r#"{"t1": {"disk_space": [
            {"rule_id": "high_disk", "condition": "Payload.usage_percentage > 75", "action": "Event.should_handle = true",
             "deduplication": true, "dedup_window": "1h"}
        ]}}"#,
    );
    let sha = hex::encode(Sha256::digest(b"80|abcd"));
    h.store
        .insert_at(
            &NewProcessedEvent {
                tenant_id: "t1".into(),
                event_type: "disk_space".into(),
                rule_id: "high_disk".into(),
                event_sha: sha,
                event_details: "{}".into(),
                occurred_at: None,
            },
            Utc::now() - chrono::Duration::hours(2),
        )
        .unwrap();

    assert!(h.dispatch(&disk("t1", 80, "abcd")).await.unwrap());
    assert_eq!(h.store.records().len(), 2);
}

#[tokio::test]
async fn duplicate_rule_falls_through_to_next_rule() {
    let h = Harness::new(
        r#"{"t1": {"disk_space": [
            {"rule_id": "once", "condition": "true", "action": "Event.should_handle = true",
             "deduplication": true, "dedup_window": "1h"},
            {"rule_id": "always", "condition": "true", "action": "Event.should_handle = true"}
        ]}}"#,
    );
    let raw = disk("t1", 80, "abcd");

    assert!(h.dispatch(&raw).await.unwrap());
    assert!(h.dispatch(&raw).await.unwrap());

    let rules: Vec<String> = h.store.records().into_iter().map(|r| r.rule_id).collect();
    assert_eq!(rules, vec!["once", "always"]);
}

#[tokio::test]
async fn every_rule_gets_a_fresh_scope() {
    let h = Harness::new(
        r#"{"t1": {"disk_space": [
            {"rule_id": "a", "condition": "false", "action": "Event.should_handle = true"},
            {"rule_id": "b", "condition": "false", "action": "Event.should_handle = true"}
        ]}}"#,
    );
    h.dispatch(&disk("t1", 80, "abcd")).await.unwrap();
    h.dispatch(&disk("t1", 80, "abcd")).await.unwrap();

    let mut scopes = h.evaluator.scopes();
    assert_eq!(scopes.len(), 4);
    scopes.sort();
    scopes.dedup();
    assert_eq!(scopes.len(), 4);
}

// ---------------------------------------------------------------------------
// Raw JSON payloads
// ---------------------------------------------------------------------------

const RAW_RULES: &str = r#"{"t1": {"raw_json": [
    {"rule_id": "big", "condition": "Payload.field2 > 100", "action": "Event.should_handle = true"}
]}}"#;

fn raw_event(payload: &str) -> String {
    json!({"type": "raw_json", "tenant_id": "t1", "payload": payload}).to_string()
}

#[tokio::test]
async fn string_payload_is_evaluated_as_an_object() {
    let h = Harness::new(RAW_RULES);
    h.registry.register_payload::<RawJson>("raw_json");

    assert!(h.dispatch(&raw_event(r#"{"field2":123}"#)).await.unwrap());

    let records = h.store.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].event_details.is_object());
    assert_eq!(records[0].event_details["field2"], 123);
    assert_eq!(
        records[0].event_sha,
        hex::encode(Sha256::digest(br#"{"field2":123}"#))
    );
}

#[tokio::test]
async fn string_payload_must_hold_json() {
    let h = Harness::new(RAW_RULES);
    h.registry.register_payload::<RawJson>("raw_json");

    let err = h.dispatch(&raw_event("not json")).await.unwrap_err();
    assert!(matches!(err, Error::InvalidEvent(_)), "{err}");
    assert_eq!(err.stage(), Stage::Validating);
    assert_eq!(h.store.sessions_acquired(), 0);
    assert!(h.evaluator.rule_ids().is_empty());
}

// ---------------------------------------------------------------------------
// Decode and validation gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn negative_usage_is_invalid_before_lookup() {
    let h = Harness::new(HIGH_DISK);

    let err = h.dispatch(&disk("t1", -5, "abcd")).await.unwrap_err();
    assert!(matches!(err, Error::InvalidEvent(_)), "{err}");
    assert_eq!(err.stage(), Stage::Validating);
    assert_eq!(h.store.sessions_acquired(), 0);
    assert!(h.evaluator.rule_ids().is_empty());
}

#[tokio::test]
async fn missing_tenant_is_invalid() {
    let h = Harness::new(HIGH_DISK);
    let err = h.dispatch(&disk("", 80, "abcd")).await.unwrap_err();
    assert!(matches!(err, Error::InvalidEvent(_)));
    assert_eq!(h.store.sessions_acquired(), 0);
}

#[tokio::test]
async fn decode_failures_are_distinguished() {
    let h = Harness::new(HIGH_DISK);

    let err = h
        .dispatch(r#"{"type": "unknown_x", "tenant_id": "t1", "payload": {}}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownEventType(ref t) if t == "unknown_x"));

    let err = h.dispatch(r#"{"tenant_id": "t1"}"#).await.unwrap_err();
    assert!(matches!(err, Error::MissingType));

    let err = h.dispatch("not json").await.unwrap_err();
    assert!(matches!(err, Error::MalformedInput(_)));

    let err = h
        .dispatch(r#"{"type": "disk_space", "tenant_id": "t1", "payload": {"usage_percentage": "lots"}}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PayloadDecode { .. }));
    assert_eq!(err.stage(), Stage::Decoding);

    assert_eq!(h.store.sessions_acquired(), 0);
}

// ---------------------------------------------------------------------------
// Hard failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rule_compile_error_aborts_without_trying_later_rules() {
    let h = Harness::new(
        r#"{"t1": {"disk_space": [
            {"rule_id": "broken", "condition": "Payload.usage_percentage >", "action": "Event.should_handle = true"},
            {"rule_id": "fine", "condition": "true", "action": "Event.should_handle = true"}
        ]}}"#,
    );

    let err = h.dispatch(&disk("t1", 80, "abcd")).await.unwrap_err();
    match &err {
        Error::RuleExecution { rule_id, source } => {
            assert_eq!(rule_id, "broken");
            assert!(matches!(source, EvaluatorError::Compile(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.stage(), Stage::Execute);
    assert_eq!(h.evaluator.rule_ids(), vec!["broken"]);
    assert!(h.store.records().is_empty());
    assert_eq!(h.store.open_sessions(), 0);
}

#[tokio::test]
async fn dedup_check_failure_aborts() {
    let h = Harness::new(
        r#"{"t1": {"disk_space": [
            {"rule_id": "high_disk", "condition": "true", "action": "Event.should_handle = true",
             "deduplication": true, "dedup_window": "1h"}
        ]}}"#,
    );
    h.store.fail_next(StoreOp::IsDuplicate);

    let err = h.dispatch(&disk("t1", 80, "abcd")).await.unwrap_err();
    assert!(matches!(
        err,
        Error::DuplicateCheckFailed { ref rule_id, .. } if rule_id == "high_disk"
    ));
    assert!(h.evaluator.rule_ids().is_empty());
    assert_eq!(h.store.open_sessions(), 0);
}

#[tokio::test]
async fn persistence_failure_is_surfaced() {
    let h = Harness::new(HIGH_DISK);
    h.store.fail_next(StoreOp::Save);

    let err = h.dispatch(&disk("t1", 80, "abcd")).await.unwrap_err();
    assert!(matches!(err, Error::Persistence { ref rule_id, .. } if rule_id == "high_disk"));
    assert_eq!(err.stage(), Stage::PersistOnMatch);
    assert!(h.store.records().is_empty());
    assert_eq!(h.store.open_sessions(), 0);
}

#[tokio::test]
async fn session_acquire_failure_is_surfaced() {
    let h = Harness::new(HIGH_DISK);
    h.store.fail_next(StoreOp::Acquire);

    let err = h.dispatch(&disk("t1", 80, "abcd")).await.unwrap_err();
    assert!(matches!(err, Error::SessionUnavailable { .. }), "{err}");
    assert_eq!(err.stage(), Stage::RuleLookup);
    assert!(h.evaluator.rule_ids().is_empty());
}

#[tokio::test]
async fn unreadable_rule_document_is_rule_load_error() {
    let registry = EventRegistry::new();
    events::register_builtin(&registry);
    let orchestrator = Orchestrator::with_builtin_evaluator(
        Arc::new(RuleSource::new("/nonexistent/rules.json", "default")),
        Arc::new(MemoryEventStore::new()),
    );

    let err = registry
        .resolve_and_dispatch(
            &EvalContext::background(),
            &orchestrator,
            disk("t1", 80, "abcd").as_bytes(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RuleLoad { .. }));
    assert_eq!(err.stage(), Stage::RuleLookup);
    assert!(!orchestrator.rules().is_loaded());
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Compiles nothing; never finishes.
struct Stalled;

#[async_trait]
impl RuleEvaluator for Stalled {
    async fn compile(
        &self,
        _scope: &KnowledgeScope,
        _definition: &RuleDefinition,
    ) -> Result<Box<dyn CompiledRule>, EvaluatorError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn cancelled_before_start() {
    let h = Harness::new(HIGH_DISK);
    let ctx = EvalContext::background();
    ctx.cancel();

    let err = h.dispatch_with(&ctx, &disk("t1", 80, "abcd")).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled { stage: Stage::Validating }));
    assert_eq!(h.store.sessions_acquired(), 0);
}

#[tokio::test]
async fn cancellation_during_execute_releases_session() {
    let h = Harness::with_evaluator(HIGH_DISK, Some(Arc::new(Stalled)));
    let ctx = EvalContext::background();

    let canceller = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctx.cancel();
        })
    };

    let err = h.dispatch_with(&ctx, &disk("t1", 80, "abcd")).await.unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, Error::Cancelled { stage: Stage::Execute }));
    assert!(err.is_cancellation());
    assert_eq!(h.store.sessions_acquired(), 1);
    assert_eq!(h.store.open_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn deadline_during_execute() {
    let h = Harness::with_evaluator(HIGH_DISK, Some(Arc::new(Stalled)));
    let ctx = EvalContext::background().with_timeout(Duration::from_secs(2));

    let err = h.dispatch_with(&ctx, &disk("t1", 80, "abcd")).await.unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded { stage: Stage::Execute }));
    assert_eq!(h.store.open_sessions(), 0);
    assert!(h.store.records().is_empty());
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

/// Yields once before compiling, so overlapping evaluations interleave
/// between their duplicate checks and their saves.
struct Yielding;

#[async_trait]
impl RuleEvaluator for Yielding {
    async fn compile(
        &self,
        scope: &KnowledgeScope,
        definition: &RuleDefinition,
    ) -> Result<Box<dyn CompiledRule>, EvaluatorError> {
        tokio::task::yield_now().await;
        ExprEvaluator.compile(scope, definition).await
    }
}

#[tokio::test]
async fn overlapping_duplicates_fire_once() {
    let h = Harness::with_evaluator(
        r#"{"t1": {"disk_space": [
            {"rule_id": "high_disk", "condition": "Payload.usage_percentage > 75", "action": "Event.should_handle = true",
             "deduplication": true, "dedup_window": "1h"}
        ]}}"#,
        Some(Arc::new(Yielding)),
    );
    let raw = disk("t1", 80, "abcd");

    let (a, b) = tokio::join!(h.dispatch(&raw), h.dispatch(&raw));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(a ^ b, "exactly one evaluation may fire: a={a} b={b}");
    assert_eq!(h.store.records().len(), 1);
    assert_eq!(h.store.open_sessions(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_duplicates_fire_once_across_threads() {
    let h = Arc::new(Harness::with_evaluator(
        r#"{"t1": {"disk_space": [
            {"rule_id": "high_disk", "condition": "true", "action": "Event.should_handle = true",
             "deduplication": true, "dedup_window": "1h"}
        ]}}"#,
        Some(Arc::new(Yielding)),
    ));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.dispatch(&disk("t1", 80, "abcd")).await })
        })
        .collect();
    let mut fired = 0;
    for task in tasks {
        if task.await.unwrap().unwrap() {
            fired += 1;
        }
    }

    assert_eq!(fired, 1);
    assert_eq!(h.store.records().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_events_each_get_their_own_session() {
    let h = Arc::new(Harness::new(HIGH_DISK));

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.dispatch(&disk("t1", 80, &format!("host-{i}"))).await })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().unwrap());
    }

    assert_eq!(h.store.records().len(), 16);
    assert_eq!(h.store.sessions_acquired(), 16);
    assert_eq!(h.store.open_sessions(), 0);
}
