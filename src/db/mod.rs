//! Postgres-backed event store: connection pool, migrations, health check.
//!
//! Each evaluation checks one connection out of the pool as its
//! [`StoreSession`](crate::store::StoreSession); dropping the session returns
//! the connection.

pub mod processed;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::Result;
use crate::store::{EventStore, StoreSession};

pub use processed::PgSession;

/// Database handle. Owns the connection pool.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EventStore for Db {
    async fn acquire(&self) -> Result<Box<dyn StoreSession>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PgSession::new(conn)))
    }
}
