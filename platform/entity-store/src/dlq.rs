//! Dead-letter queue for events whose retries were exhausted.
//!
//! Mirrors the `failed_events` table pattern: once
//! [`event_bus::consumer_retry::retry_with_backoff`] gives up, the consumer
//! task records the envelope and the terminating error here instead of
//! dropping it, so an operator can inspect and replay it later.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Mutex;
use uuid::Uuid;

use crate::StoreError;

#[derive(Debug, Clone)]
pub struct FailedEvent {
    pub event_id: Uuid,
    pub subject: String,
    pub tenant_id: String,
    pub envelope: Value,
    pub error: String,
    pub retry_count: i32,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    async fn record_failure(
        &self,
        event_id: Uuid,
        subject: &str,
        tenant_id: &str,
        envelope: &Value,
        error: &str,
        retry_count: i32,
    ) -> Result<(), StoreError>;
}

pub struct PostgresDeadLetterQueue {
    pool: PgPool,
}

impl PostgresDeadLetterQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterQueue for PostgresDeadLetterQueue {
    async fn record_failure(
        &self,
        event_id: Uuid,
        subject: &str,
        tenant_id: &str,
        envelope: &Value,
        error: &str,
        retry_count: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO failed_events
                (event_id, subject, tenant_id, envelope, error, retry_count, failed_at)
             VALUES ($1, $2, $3, $4, $5, $6, NOW())
             ON CONFLICT (event_id) DO UPDATE SET
                error = EXCLUDED.error,
                retry_count = EXCLUDED.retry_count,
                failed_at = EXCLUDED.failed_at",
        )
        .bind(event_id)
        .bind(subject)
        .bind(tenant_id)
        .bind(envelope)
        .bind(error)
        .bind(retry_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory DLQ for tests: records every failure and lets assertions
/// inspect them directly instead of querying a database.
#[derive(Default)]
pub struct InMemoryDeadLetterQueue {
    failures: Mutex<Vec<FailedEvent>>,
}

impl InMemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> Vec<FailedEvent> {
        self.failures
            .lock()
            .expect("dlq poisoned")
            .clone()
    }
}

#[async_trait]
impl DeadLetterQueue for InMemoryDeadLetterQueue {
    async fn record_failure(
        &self,
        event_id: Uuid,
        subject: &str,
        tenant_id: &str,
        envelope: &Value,
        error: &str,
        retry_count: i32,
    ) -> Result<(), StoreError> {
        self.failures.lock().expect("dlq poisoned").push(FailedEvent {
            event_id,
            subject: subject.to_string(),
            tenant_id: tenant_id.to_string(),
            envelope: envelope.clone(),
            error: error.to_string(),
            retry_count,
            failed_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_dlq_records_failure() {
        let dlq = InMemoryDeadLetterQueue::new();
        let event_id = Uuid::new_v4();

        dlq.record_failure(
            event_id,
            "billing.invoice.created",
            "tenant-a",
            &json!({"invoice_id": "inv-1"}),
            "payment gateway timed out",
            3,
        )
        .await
        .unwrap();

        let failures = dlq.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].event_id, event_id);
        assert_eq!(failures[0].retry_count, 3);
    }
}
