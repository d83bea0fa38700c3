//! Built-in event types.

pub mod disk;

pub use disk::{DiskUsageEvent, DiskUsagePayload};

use crate::registry::EventRegistry;

/// Register every built-in event type.
pub fn register_builtin(registry: &EventRegistry) {
    registry.register_payload::<DiskUsagePayload>(disk::EVENT_TYPE);
}
