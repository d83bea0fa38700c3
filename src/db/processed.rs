//! Processed-event queries: duplicate check, append, retention cleanup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::{Connection, Postgres};

use crate::error::Result;
use crate::model::{NewProcessedEvent, ProcessedEvent};
use crate::store::{DedupQuery, StoreSession};
use crate::telemetry::metrics;

/// A pooled connection scoped to one evaluation.
pub struct PgSession {
    conn: PoolConnection<Postgres>,
}

impl PgSession {
    pub(crate) fn new(conn: PoolConnection<Postgres>) -> Self {
        Self { conn }
    }
}

fn record_op(operation: &'static str) {
    metrics::store_operations().add(1, &[KeyValue::new("operation", operation)]);
}

#[async_trait]
impl StoreSession for PgSession {
    async fn is_duplicate(&mut self, query: DedupQuery<'_>) -> Result<bool> {
        // Window arithmetic happens on the server clock, the same clock that
        // stamped created_at.
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                 SELECT 1 FROM processed_events
                 WHERE tenant_id = $1 AND event_type = $2 AND rule_id = $3 AND event_sha = $4
                 AND created_at >= now() - ($5::double precision * interval '1 second')
             )",
        )
        .bind(query.tenant_id)
        .bind(query.event_type)
        .bind(query.rule_id)
        .bind(query.event_sha)
        .bind(query.window.as_secs_f64())
        .fetch_one(&mut *self.conn)
        .await?;
        record_op("is_duplicate");
        Ok(exists)
    }

    async fn save(&mut self, event: &NewProcessedEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO processed_events (tenant_id, event_type, rule_id, event_sha, event_details, occurred_at)
             VALUES ($1, $2, $3, $4, $5::jsonb, $6)",
        )
        .bind(&event.tenant_id)
        .bind(&event.event_type)
        .bind(&event.rule_id)
        .bind(&event.event_sha)
        .bind(&event.event_details)
        .bind(event.occurred_at)
        .execute(&mut *self.conn)
        .await?;
        record_op("save");
        Ok(())
    }

    async fn save_unless_duplicate(
        &mut self,
        event: &NewProcessedEvent,
        window: Duration,
    ) -> Result<bool> {
        let mut tx = self.conn.begin().await?;

        // Serializes concurrent firings of the same identity until commit.
        let identity = format!(
            "{}|{}|{}|{}",
            event.tenant_id, event.event_type, event.rule_id, event.event_sha
        );
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&identity)
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            "INSERT INTO processed_events (tenant_id, event_type, rule_id, event_sha, event_details, occurred_at)
             SELECT $1, $2, $3, $4, $5::jsonb, $6
             WHERE NOT EXISTS (
                 SELECT 1 FROM processed_events
                 WHERE tenant_id = $1 AND event_type = $2 AND rule_id = $3 AND event_sha = $4
                 AND created_at >= now() - ($7::double precision * interval '1 second')
             )",
        )
        .bind(&event.tenant_id)
        .bind(&event.event_type)
        .bind(&event.rule_id)
        .bind(&event.event_sha)
        .bind(&event.event_details)
        .bind(event.occurred_at)
        .bind(window.as_secs_f64())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        record_op("save_unless_duplicate");
        Ok(inserted == 1)
    }

    async fn cleanup(&mut self, older_than: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM processed_events WHERE created_at < $1")
            .bind(older_than)
            .execute(&mut *self.conn)
            .await?
            .rows_affected();
        record_op("cleanup");
        Ok(deleted)
    }
}

impl super::Db {
    /// Most recent processed events for a tenant, newest first.
    pub async fn list_processed_events(
        &self,
        tenant_id: &str,
        limit: i64,
    ) -> Result<Vec<ProcessedEvent>> {
        let rows: Vec<ProcessedEvent> = sqlx::query_as(
            "SELECT id, tenant_id, event_type, rule_id, event_sha, COALESCE(event_details, 'null'::jsonb) AS event_details, occurred_at, created_at
             FROM processed_events
             WHERE tenant_id = $1
             ORDER BY created_at DESC, id DESC
             LIMIT $2",
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
