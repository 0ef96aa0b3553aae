//! Idempotent event consumption.
//!
//! At-least-once delivery means every consumer task can see the same
//! `event_id` twice (a redelivery after a crash before the ack, a
//! duplicate publish from the outbox poller racing a retry). The ledger
//! records which `(key, processor)` pairs have already been applied so a
//! handler can check-then-skip instead of re-running side effects.
//!
//! The same trait backs compensation idempotency (spec.md's
//! `applied_compensations` table): the key there is a composite of
//! `(invoice_id, product_id, compensation_type)` rather than an event id,
//! produced by [`compensation_key`].

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Mutex;

use crate::StoreError;

#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Has `key` already been processed by `processor`?
    async fn is_processed(&self, key: &str, processor: &str) -> Result<bool, StoreError>;

    /// Record that `key` has now been processed by `processor`.
    async fn mark_processed(
        &self,
        key: &str,
        event_type: &str,
        processor: &str,
    ) -> Result<(), StoreError>;
}

/// Build the composite key used for inventory compensation idempotency.
pub fn compensation_key(invoice_id: &str, product_id: &str, compensation_type: &str) -> String {
    format!("{invoice_id}:{product_id}:{compensation_type}")
}

pub struct PostgresIdempotencyLedger {
    pool: PgPool,
    table: &'static str,
}

impl PostgresIdempotencyLedger {
    /// `table` must be a static identifier (`"processed_events"` or
    /// `"applied_compensations"`); it is never user input, so building the
    /// query by format is safe here.
    pub fn new(pool: PgPool, table: &'static str) -> Self {
        Self { pool, table }
    }
}

#[async_trait]
impl IdempotencyLedger for PostgresIdempotencyLedger {
    async fn is_processed(&self, key: &str, processor: &str) -> Result<bool, StoreError> {
        let query = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE event_key = $1 AND processor = $2)",
            self.table
        );
        let exists: bool = sqlx::query_scalar(&query)
            .bind(key)
            .bind(processor)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn mark_processed(
        &self,
        key: &str,
        event_type: &str,
        processor: &str,
    ) -> Result<(), StoreError> {
        let query = format!(
            "INSERT INTO {} (event_key, event_type, processor, processed_at)
             VALUES ($1, $2, $3, NOW())
             ON CONFLICT (event_key, processor) DO NOTHING",
            self.table
        );
        sqlx::query(&query)
            .bind(key)
            .bind(event_type)
            .bind(processor)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-memory ledger for unit and integration tests that don't stand up Postgres.
#[derive(Default)]
pub struct InMemoryIdempotencyLedger {
    seen: Mutex<HashSet<(String, String)>>,
}

impl InMemoryIdempotencyLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryIdempotencyLedger {
    async fn is_processed(&self, key: &str, processor: &str) -> Result<bool, StoreError> {
        let seen = self.seen.lock().expect("idempotency ledger poisoned");
        Ok(seen.contains(&(key.to_string(), processor.to_string())))
    }

    async fn mark_processed(
        &self,
        key: &str,
        _event_type: &str,
        processor: &str,
    ) -> Result<(), StoreError> {
        let mut seen = self.seen.lock().expect("idempotency ledger poisoned");
        seen.insert((key.to_string(), processor.to_string()));
        Ok(())
    }
}

/// Run `handler` only if `key` has not already been processed by `processor`,
/// then record it. Mirrors the check-process-mark pattern used by every
/// consumer task.
pub async fn process_idempotent<L, F, Fut>(
    ledger: &L,
    key: &str,
    event_type: &str,
    processor: &str,
    handler: F,
) -> Result<bool, StoreError>
where
    L: IdempotencyLedger + ?Sized,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<(), StoreError>>,
{
    if ledger.is_processed(key, processor).await? {
        return Ok(false);
    }
    handler().await?;
    ledger.mark_processed(key, event_type, processor).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_ledger_tracks_per_processor() {
        let ledger = InMemoryIdempotencyLedger::new();

        assert!(!ledger.is_processed("evt-1", "billing").await.unwrap());
        ledger
            .mark_processed("evt-1", "invoice.created", "billing")
            .await
            .unwrap();
        assert!(ledger.is_processed("evt-1", "billing").await.unwrap());

        // A different processor has not seen it.
        assert!(!ledger.is_processed("evt-1", "notifications").await.unwrap());
    }

    #[tokio::test]
    async fn test_process_idempotent_runs_handler_once() {
        let ledger = InMemoryIdempotencyLedger::new();
        let mut runs = 0;

        for _ in 0..3 {
            let ran = process_idempotent(&ledger, "evt-2", "payment.succeeded", "billing", || {
                runs += 1;
                async { Ok(()) }
            })
            .await
            .unwrap();

            if runs == 1 {
                assert!(ran);
            } else {
                assert!(!ran);
            }
        }

        assert_eq!(runs, 1);
    }

    #[test]
    fn test_compensation_key_is_stable_for_same_triple() {
        let a = compensation_key("inv-1", "sku-42", "release_reservation");
        let b = compensation_key("inv-1", "sku-42", "release_reservation");
        assert_eq!(a, b);
        let c = compensation_key("inv-1", "sku-42", "refund");
        assert_ne!(a, c);
    }
}
