//! Metric instruments.
//!
//! Created on demand from the `"eventgate"` meter of the global
//! `MeterProvider`. With no provider installed they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter(super::SERVICE_NAME)
}

/// Counter: events run through the orchestrator.
/// Labels: `event_type`, `result` ("handled" | "unhandled" | "error").
pub fn events_processed() -> Counter<u64> {
    meter()
        .u64_counter("eventgate.events.processed")
        .with_description("Number of events evaluated")
        .build()
}

/// Counter: rules executed against an event.
/// Labels: `event_type`, `rule_id`.
pub fn rules_evaluated() -> Counter<u64> {
    meter()
        .u64_counter("eventgate.rules.evaluated")
        .with_description("Number of rule executions")
        .build()
}

/// Counter: rules skipped because the fingerprint was seen in the window.
/// Labels: `event_type`, `rule_id`.
pub fn rules_deduplicated() -> Counter<u64> {
    meter()
        .u64_counter("eventgate.rules.deduplicated")
        .with_description("Number of rules skipped as duplicates")
        .build()
}

/// Counter: store round trips.
/// Labels: `operation` ("is_duplicate" | "save" | "save_unless_duplicate" | "cleanup").
pub fn store_operations() -> Counter<u64> {
    meter()
        .u64_counter("eventgate.store.operations")
        .with_description("Number of processed-event store operations")
        .build()
}

/// Counter: processed events removed by retention sweeps.
pub fn cleanup_deleted() -> Counter<u64> {
    meter()
        .u64_counter("eventgate.cleanup.deleted")
        .with_description("Processed events deleted by cleanup")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("eventgate.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
