//! Payment persistence.
//!
//! Follows the same single-row `UPDATE ... WHERE status = $1` predicate as
//! `billing::store`/`accounts::store`: a payment moves `PENDING ->
//! {SUCCEEDED, FAILED}` exactly once, and `list_pending_for_customer`
//! backs the deletion validator's "mid-authorization" veto check.

use async_trait::async_trait;
use entity_store::StoreError;
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::{Payment, PaymentStatus};

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn insert(&self, payment: &Payment) -> Result<(), StoreError>;
    async fn get(&self, payment_id: Uuid) -> Result<Option<Payment>, StoreError>;
    async fn replace(&self, expected_status: PaymentStatus, new: &Payment) -> Result<bool, StoreError>;
    async fn list_pending_for_customer(&self, customer_id: &str) -> Result<Vec<Payment>, StoreError>;
}

pub struct PostgresPaymentStore {
    pool: PgPool,
}

impl PostgresPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentStore for PostgresPaymentStore {
    async fn insert(&self, payment: &Payment) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO payments
                (payment_id, invoice_id, customer_id, amount, status, failure_reason, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
        )
        .bind(payment.payment_id)
        .bind(payment.invoice_id)
        .bind(&payment.customer_id)
        .bind(payment.amount)
        .bind(payment.status)
        .bind(&payment.failure_reason)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, payment_id: Uuid) -> Result<Option<Payment>, StoreError> {
        let row = sqlx::query_as::<_, PaymentRow>(
            "SELECT payment_id, invoice_id, customer_id, amount, status, failure_reason, created_at, updated_at
             FROM payments WHERE payment_id = $1",
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn replace(&self, expected_status: PaymentStatus, new: &Payment) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE payments SET status = $1, failure_reason = $2, updated_at = $3
             WHERE payment_id = $4 AND status = $5",
        )
        .bind(new.status)
        .bind(&new.failure_reason)
        .bind(new.updated_at)
        .bind(new.payment_id)
        .bind(expected_status)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_pending_for_customer(&self, customer_id: &str) -> Result<Vec<Payment>, StoreError> {
        let rows = sqlx::query_as::<_, PaymentRow>(
            "SELECT payment_id, invoice_id, customer_id, amount, status, failure_reason, created_at, updated_at
             FROM payments WHERE customer_id = $1 AND status = 'PENDING'",
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    payment_id: Uuid,
    invoice_id: Uuid,
    customer_id: String,
    amount: Decimal,
    status: PaymentStatus,
    failure_reason: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<PaymentRow> for Payment {
    fn from(row: PaymentRow) -> Self {
        Payment {
            payment_id: row.payment_id,
            invoice_id: row.invoice_id,
            customer_id: row.customer_id,
            amount: row.amount,
            status: row.status,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// In-memory store for unit and integration tests.
#[derive(Default)]
pub struct InMemoryPaymentStore {
    rows: Mutex<HashMap<Uuid, Payment>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn insert(&self, payment: &Payment) -> Result<(), StoreError> {
        self.rows
            .lock()
            .expect("payment store poisoned")
            .insert(payment.payment_id, payment.clone());
        Ok(())
    }

    async fn get(&self, payment_id: Uuid) -> Result<Option<Payment>, StoreError> {
        Ok(self.rows.lock().expect("payment store poisoned").get(&payment_id).cloned())
    }

    async fn replace(&self, expected_status: PaymentStatus, new: &Payment) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().expect("payment store poisoned");
        match rows.get(&new.payment_id) {
            Some(current) if current.status == expected_status => {
                rows.insert(new.payment_id, new.clone());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound),
        }
    }

    async fn list_pending_for_customer(&self, customer_id: &str) -> Result<Vec<Payment>, StoreError> {
        Ok(self
            .rows
            .lock()
            .expect("payment store poisoned")
            .values()
            .filter(|p| p.customer_id == customer_id && p.status == PaymentStatus::Pending)
            .cloned()
            .collect())
    }
}
