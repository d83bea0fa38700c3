//! Event evaluation span helpers.

use tracing::Span;

use crate::model::Stage;

/// Start a span for one event evaluation.
///
/// `event.stage` starts empty and is filled in by [`record_stage`].
/// `event.sha` and `event.rule` are recorded once known.
pub fn start_event_span(event_type: &str, tenant_id: &str) -> Span {
    tracing::info_span!(
        "event.evaluate",
        "event.type" = event_type,
        "event.tenant" = tenant_id,
        "event.sha" = tracing::field::Empty,
        "event.rule" = tracing::field::Empty,
        "event.stage" = tracing::field::Empty,
    )
}

/// Record entry into `stage` on `span`.
pub fn record_stage(span: &Span, stage: Stage) {
    span.record("event.stage", tracing::field::display(stage));
    span.in_scope(|| {
        tracing::debug!(stage = %stage, "stage");
    });
}
