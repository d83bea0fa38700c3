//! In-memory store for tests and dry runs. Thread-safe; no database needed.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{DedupQuery, EventStore, StoreSession};
use crate::error::{Error, Result};
use crate::model::{NewProcessedEvent, ProcessedEvent};

/// Store operation, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Acquire,
    IsDuplicate,
    Save,
    Cleanup,
}

#[derive(Default)]
struct Inner {
    records: Mutex<Vec<ProcessedEvent>>,
    next_id: AtomicI64,
    open_sessions: AtomicUsize,
    sessions_acquired: AtomicUsize,
    failing: Mutex<Vec<StoreOp>>,
}

impl Inner {
    fn records(&self) -> MutexGuard<'_, Vec<ProcessedEvent>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Consume a pending injected failure for `op`, if any.
    fn take_failure(&self, op: StoreOp) -> Result<()> {
        let mut failing = self.failing.lock().unwrap_or_else(|e| e.into_inner());
        match failing.iter().position(|f| *f == op) {
            Some(i) => {
                failing.remove(i);
                Err(Error::Other(format!("injected {op:?} failure")))
            }
            None => Ok(()),
        }
    }
}

/// Processed events held in a `Vec`. Clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryEventStore {
    inner: Arc<Inner>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All processed events, in insertion order.
    pub fn records(&self) -> Vec<ProcessedEvent> {
        self.inner.records().clone()
    }

    /// Sessions currently checked out.
    pub fn open_sessions(&self) -> usize {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }

    /// Sessions handed out since creation.
    pub fn sessions_acquired(&self) -> usize {
        self.inner.sessions_acquired.load(Ordering::SeqCst)
    }

    /// Make the next `op` fail once.
    pub fn fail_next(&self, op: StoreOp) {
        self.inner
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(op);
    }

    /// Insert a record with an explicit creation time.
    pub fn insert_at(&self, event: &NewProcessedEvent, created_at: DateTime<Utc>) -> Result<()> {
        let record = self.build(event, created_at)?;
        self.inner.records().push(record);
        Ok(())
    }

    fn build(
        &self,
        event: &NewProcessedEvent,
        created_at: DateTime<Utc>,
    ) -> Result<ProcessedEvent> {
        let event_details = serde_json::from_str(&event.event_details)
            .map_err(|e| Error::Other(format!("event details are not JSON: {e}")))?;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ProcessedEvent {
            id,
            tenant_id: event.tenant_id.clone(),
            event_type: event.event_type.clone(),
            rule_id: event.rule_id.clone(),
            event_sha: event.event_sha.clone(),
            event_details,
            occurred_at: event.occurred_at,
            created_at,
        })
    }
}

fn seen_within(records: &[ProcessedEvent], query: &DedupQuery<'_>) -> Result<bool> {
    let window = chrono::Duration::from_std(query.window)
        .map_err(|e| Error::Other(format!("dedup window out of range: {e}")))?;
    let cutoff = Utc::now() - window;
    Ok(records.iter().any(|r| {
        r.tenant_id == query.tenant_id
            && r.event_type == query.event_type
            && r.rule_id == query.rule_id
            && r.event_sha == query.event_sha
            && r.created_at >= cutoff
    }))
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn acquire(&self) -> Result<Box<dyn StoreSession>> {
        self.inner.take_failure(StoreOp::Acquire)?;
        self.inner.open_sessions.fetch_add(1, Ordering::SeqCst);
        self.inner.sessions_acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            store: self.clone(),
        }))
    }
}

struct MemorySession {
    store: MemoryEventStore,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.store.inner.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn is_duplicate(&mut self, query: DedupQuery<'_>) -> Result<bool> {
        self.store.inner.take_failure(StoreOp::IsDuplicate)?;
        seen_within(&self.store.inner.records(), &query)
    }

    async fn save(&mut self, event: &NewProcessedEvent) -> Result<()> {
        self.store.inner.take_failure(StoreOp::Save)?;
        self.store.insert_at(event, Utc::now())
    }

    async fn save_unless_duplicate(
        &mut self,
        event: &NewProcessedEvent,
        window: Duration,
    ) -> Result<bool> {
        self.store.inner.take_failure(StoreOp::Save)?;
        let record = self.store.build(event, Utc::now())?;
        // Check and push under one lock.
        let mut records = self.store.inner.records();
        if seen_within(&records, &DedupQuery::for_record(event, window))? {
            return Ok(false);
        }
        records.push(record);
        Ok(true)
    }

    async fn cleanup(&mut self, older_than: DateTime<Utc>) -> Result<u64> {
        self.store.inner.take_failure(StoreOp::Cleanup)?;
        let mut records = self.store.inner.records();
        let before = records.len();
        records.retain(|r| r.created_at >= older_than);
        Ok((before - records.len()) as u64)
    }
}
