//! Disk usage reported by a monitored instance.

use serde::{Deserialize, Serialize};

use crate::event::{Event, EventPayload};

pub const EVENT_TYPE: &str = "disk_space";

pub type DiskUsageEvent = Event<DiskUsagePayload>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsagePayload {
    pub usage_percentage: i64,
    pub instance_id: String,
    pub disk_size_in_bytes: i64,
}

impl EventPayload for DiskUsagePayload {
    const FIELDS: &'static [&'static str] =
        &["usage_percentage", "instance_id", "disk_size_in_bytes"];

    fn validate(&self) -> Result<(), String> {
        if self.usage_percentage < 0 {
            return Err("usage_percentage should be greater than or equal to 0".to_string());
        }
        if self.instance_id.is_empty() {
            return Err("instance_id cannot be empty".to_string());
        }
        if self.disk_size_in_bytes <= 0 {
            return Err("disk_size_in_bytes should be greater than 0".to_string());
        }
        Ok(())
    }

    /// Same usage on the same instance is the same occurrence.
    fn dedup_key(&self) -> String {
        format!("{}|{}", self.usage_percentage, self.instance_id)
    }
}
