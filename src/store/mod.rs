//! Deduplication store contract.
//!
//! The orchestrator acquires one [`StoreSession`] per evaluation and drops
//! it on every exit path. Sessions are never shared between evaluations.
//! Implemented by [`crate::db::Db`] (Postgres) and [`MemoryEventStore`].

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::NewProcessedEvent;

pub use memory::MemoryEventStore;

/// Identity of a prior firing: same tenant, type, rule and fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupQuery<'a> {
    pub tenant_id: &'a str,
    pub event_type: &'a str,
    pub rule_id: &'a str,
    pub event_sha: &'a str,
    /// How far back from now a prior firing counts.
    pub window: Duration,
}

impl<'a> DedupQuery<'a> {
    /// The identity `event` would be deduplicated under.
    pub fn for_record(event: &'a NewProcessedEvent, window: Duration) -> Self {
        Self {
            tenant_id: &event.tenant_id,
            event_type: &event.event_type,
            rule_id: &event.rule_id,
            event_sha: &event.event_sha,
            window,
        }
    }
}

/// Source of scoped store sessions.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn StoreSession>>;
}

/// A connection-scoped handle. Released when dropped.
#[async_trait]
pub trait StoreSession: Send {
    /// Was this fingerprint already recorded for this rule within the window?
    async fn is_duplicate(&mut self, query: DedupQuery<'_>) -> Result<bool>;

    /// Append a processed event. Never overwrites an existing record.
    async fn save(&mut self, event: &NewProcessedEvent) -> Result<()>;

    /// Append `event` only if no record with its identity exists within
    /// `window`. Check and insert are atomic with respect to other sessions.
    /// Returns `false` when a concurrent or earlier firing got there first.
    async fn save_unless_duplicate(
        &mut self,
        event: &NewProcessedEvent,
        window: Duration,
    ) -> Result<bool>;

    /// Delete records created before `older_than`. Returns rows removed.
    async fn cleanup(&mut self, older_than: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
impl<S: EventStore + ?Sized> EventStore for Arc<S> {
    async fn acquire(&self) -> Result<Box<dyn StoreSession>> {
        (**self).acquire().await
    }
}
