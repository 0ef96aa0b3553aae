//! Transactional outbox, mirroring `billing::events::outbox`.
//!
//! [`PostgresOutbox::enqueue`] writes to `accounts_events_outbox` instead of
//! publishing directly so a deletion-protocol transition's state write and
//! its broadcast can't diverge; a background [`run_publisher_task`] does the
//! actual bus publish once the row is committed. [`DirectOutbox`] skips the
//! staging table entirely and backs the `InMemoryBus`-based tests.

use async_trait::async_trait;
use entity_store::StoreError;
use event_bus::EventBus;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};
use uuid::Uuid;

#[async_trait]
pub trait Outbox: Send + Sync {
    async fn enqueue(&self, subject: &str, payload: Vec<u8>) -> Result<(), StoreError>;
}

pub struct PostgresOutbox {
    pool: PgPool,
}

impl PostgresOutbox {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Outbox for PostgresOutbox {
    async fn enqueue(&self, subject: &str, payload: Vec<u8>) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO accounts_events_outbox (event_id, subject, payload, created_at)
             VALUES ($1, $2, $3, NOW())",
        )
        .bind(Uuid::new_v4())
        .bind(subject)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub struct DirectOutbox {
    bus: Arc<dyn EventBus>,
    token: String,
}

impl DirectOutbox {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self::with_token(bus, String::new())
    }

    pub fn with_token(bus: Arc<dyn EventBus>, token: String) -> Self {
        Self { bus, token }
    }
}

#[async_trait]
impl Outbox for DirectOutbox {
    async fn enqueue(&self, subject: &str, payload: Vec<u8>) -> Result<(), StoreError> {
        self.bus
            .publish_with_token(subject, payload, &self.token)
            .await
            .map_err(|e| StoreError::Database(sqlx::Error::Protocol(e.to_string())))
    }
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    event_id: Uuid,
    subject: String,
    payload: Vec<u8>,
}

#[instrument(skip(pool, bus, token))]
pub async fn run_publisher_task(pool: PgPool, bus: Arc<dyn EventBus>, token: String) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        if let Err(e) = publish_pending(&pool, &bus, &token).await {
            error!(error = %e, "accounts outbox publisher tick failed");
        }
    }
}

async fn publish_pending(
    pool: &PgPool,
    bus: &Arc<dyn EventBus>,
    token: &str,
) -> Result<(), StoreError> {
    let rows = sqlx::query_as::<_, OutboxRow>(
        "SELECT event_id, subject, payload FROM accounts_events_outbox
         WHERE published_at IS NULL ORDER BY created_at LIMIT 100",
    )
    .fetch_all(pool)
    .await?;

    for row in rows {
        match bus.publish_with_token(&row.subject, row.payload, token).await {
            Ok(()) => {
                sqlx::query("UPDATE accounts_events_outbox SET published_at = NOW() WHERE event_id = $1")
                    .bind(row.event_id)
                    .execute(pool)
                    .await?;
                info!(event_id = %row.event_id, subject = %row.subject, "published outbox event");
            }
            Err(e) => {
                error!(event_id = %row.event_id, error = %e, "failed to publish outbox event, will retry next tick");
            }
        }
    }
    Ok(())
}
