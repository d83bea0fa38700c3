//! Integration tests for telemetry initialization and span helpers.

use eventgate::model::Stage;
use eventgate::telemetry::{self, TelemetryConfig, event, metrics};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process, so a second
    // init from another test may return Err. That is acceptable here.
    let config = TelemetryConfig::new(None, "debug");
    assert_eq!(config.service_name, telemetry::SERVICE_NAME);
    let _guard = telemetry::init_telemetry(config);
}

#[test]
fn event_span_records_stages() {
    let span = event::start_event_span("disk_space", "t1");
    event::record_stage(&span, Stage::Validating);
    event::record_stage(&span, Stage::Done);
}

#[test]
fn instruments_are_usable_without_provider() {
    use opentelemetry::KeyValue;

    metrics::events_processed().add(
        1,
        &[
            KeyValue::new("event_type", "disk_space"),
            KeyValue::new("result", "handled"),
        ],
    );
    metrics::cleanup_deleted().add(3, &[]);
    metrics::operation_duration_ms().record(1.5, &[KeyValue::new("operation", "evaluate")]);
}
