//! Invoice persistence.
//!
//! Every mutation goes through [`InvoiceStore::replace`], a single-row
//! `UPDATE ... WHERE status = $expected` primitive: the caller loads the
//! invoice, runs it through a [`crate::saga`] transition function to get
//! the next state, then writes it back conditioned on the status it read
//! being unchanged. If another process (or another consumer task in this
//! one) already moved the invoice on, the predicate fails, `replace`
//! returns `false`, and the caller drops its effects instead of double-
//! applying them. [`entity_store::EntityLocks`] adds an in-process fast
//! path so two concurrently delivered events for the same invoice don't
//! even race to read: they queue on the same lock rather than both racing
//! the database predicate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use entity_store::StoreError;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::Invoice;

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn insert(&self, invoice: &Invoice) -> Result<(), StoreError>;
    async fn get(&self, invoice_id: Uuid) -> Result<Option<Invoice>, StoreError>;

    /// Write `new` in place of the row at `new.invoice_id`, but only if its
    /// current status is still `expected_status`. Returns `false` without
    /// writing anything when the predicate doesn't match.
    async fn replace(
        &self,
        expected_status: crate::models::InvoiceStatus,
        new: &Invoice,
    ) -> Result<bool, StoreError>;

    /// Invoices sitting in `PAYMENT_PROCESSING` whose `payment_timeout_at`
    /// has already passed. Used both by the timer wheel and by the
    /// startup recovery sweep that re-arms timers after a restart.
    async fn list_payment_timeouts_due(&self, now: DateTime<Utc>) -> Result<Vec<Invoice>, StoreError>;

    /// Invoices for `customer_id` still in `PENDING` or `PROCESSING` (spec.md
    /// §4.6's veto rule — narrower than "non-terminal": an invoice already in
    /// `PAYMENT_PROCESSING` does not block a deletion). A non-empty result is
    /// billing's veto in the distributed customer-deletion protocol.
    async fn list_active_for_customer(&self, customer_id: &str) -> Result<Vec<Invoice>, StoreError>;
}

pub struct PostgresInvoiceStore {
    pool: PgPool,
}

impl PostgresInvoiceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InvoiceStore for PostgresInvoiceStore {
    async fn insert(&self, invoice: &Invoice) -> Result<(), StoreError> {
        let items = serde_json::to_value(&invoice.items).map_err(|e| {
            StoreError::Database(sqlx::Error::Decode(Box::new(e)))
        })?;
        sqlx::query(
            "INSERT INTO invoices
                (invoice_id, invoice_number, tenant_id, customer_id, customer_email, items,
                 total_amount, status, inventory_status, customer_status, payment_status,
                 failure_reason, payment_timeout_at, notes, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)",
        )
        .bind(invoice.invoice_id)
        .bind(&invoice.invoice_number)
        .bind(&invoice.tenant_id)
        .bind(&invoice.customer_id)
        .bind(&invoice.customer_email)
        .bind(items)
        .bind(invoice.total_amount)
        .bind(invoice.status)
        .bind(invoice.inventory_status)
        .bind(invoice.customer_status)
        .bind(invoice.payment_status)
        .bind(&invoice.failure_reason)
        .bind(invoice.payment_timeout_at)
        .bind(&invoice.notes)
        .bind(invoice.created_at)
        .bind(invoice.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, invoice_id: Uuid) -> Result<Option<Invoice>, StoreError> {
        let row = sqlx::query_as::<_, InvoiceRow>(
            "SELECT invoice_id, invoice_number, tenant_id, customer_id, customer_email, items,
                    total_amount, status, inventory_status, customer_status, payment_status,
                    failure_reason, payment_timeout_at, notes, created_at, updated_at
             FROM invoices WHERE invoice_id = $1",
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn replace(
        &self,
        expected_status: crate::models::InvoiceStatus,
        new: &Invoice,
    ) -> Result<bool, StoreError> {
        let items = serde_json::to_value(&new.items)
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?;
        let result = sqlx::query(
            "UPDATE invoices SET
                status = $1, inventory_status = $2, customer_status = $3,
                payment_status = $4, failure_reason = $5, payment_timeout_at = $6,
                items = $7, total_amount = $8, notes = $9, updated_at = $10
             WHERE invoice_id = $11 AND status = $12",
        )
        .bind(new.status)
        .bind(new.inventory_status)
        .bind(new.customer_status)
        .bind(new.payment_status)
        .bind(&new.failure_reason)
        .bind(new.payment_timeout_at)
        .bind(items)
        .bind(new.total_amount)
        .bind(&new.notes)
        .bind(new.updated_at)
        .bind(new.invoice_id)
        .bind(expected_status)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_payment_timeouts_due(&self, now: DateTime<Utc>) -> Result<Vec<Invoice>, StoreError> {
        let rows = sqlx::query_as::<_, InvoiceRow>(
            "SELECT invoice_id, invoice_number, tenant_id, customer_id, customer_email, items,
                    total_amount, status, inventory_status, customer_status, payment_status,
                    failure_reason, payment_timeout_at, notes, created_at, updated_at
             FROM invoices
             WHERE status = 'PAYMENT_PROCESSING' AND payment_timeout_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_active_for_customer(&self, customer_id: &str) -> Result<Vec<Invoice>, StoreError> {
        let rows = sqlx::query_as::<_, InvoiceRow>(
            "SELECT invoice_id, invoice_number, tenant_id, customer_id, customer_email, items,
                    total_amount, status, inventory_status, customer_status, payment_status,
                    failure_reason, payment_timeout_at, notes, created_at, updated_at
             FROM invoices
             WHERE customer_id = $1
               AND status IN ('PENDING', 'PROCESSING')",
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(sqlx::FromRow)]
struct InvoiceRow {
    invoice_id: Uuid,
    invoice_number: String,
    tenant_id: String,
    customer_id: String,
    customer_email: String,
    items: serde_json::Value,
    total_amount: rust_decimal::Decimal,
    status: crate::models::InvoiceStatus,
    inventory_status: crate::models::SubStatus,
    customer_status: crate::models::SubStatus,
    payment_status: crate::models::SubStatus,
    failure_reason: Option<String>,
    payment_timeout_at: Option<DateTime<Utc>>,
    notes: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<InvoiceRow> for Invoice {
    fn from(row: InvoiceRow) -> Self {
        Invoice {
            invoice_id: row.invoice_id,
            invoice_number: row.invoice_number,
            tenant_id: row.tenant_id,
            customer_id: row.customer_id,
            customer_email: row.customer_email,
            items: serde_json::from_value(row.items).unwrap_or_default(),
            total_amount: row.total_amount,
            status: row.status,
            inventory_status: row.inventory_status,
            customer_status: row.customer_status,
            payment_status: row.payment_status,
            failure_reason: row.failure_reason,
            payment_timeout_at: row.payment_timeout_at,
            notes: row.notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// In-memory store for unit and integration tests.
#[derive(Default)]
pub struct InMemoryInvoiceStore {
    rows: Mutex<HashMap<Uuid, Invoice>>,
}

impl InMemoryInvoiceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvoiceStore for InMemoryInvoiceStore {
    async fn insert(&self, invoice: &Invoice) -> Result<(), StoreError> {
        self.rows
            .lock()
            .expect("invoice store poisoned")
            .insert(invoice.invoice_id, invoice.clone());
        Ok(())
    }

    async fn get(&self, invoice_id: Uuid) -> Result<Option<Invoice>, StoreError> {
        Ok(self
            .rows
            .lock()
            .expect("invoice store poisoned")
            .get(&invoice_id)
            .cloned())
    }

    async fn replace(
        &self,
        expected_status: crate::models::InvoiceStatus,
        new: &Invoice,
    ) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().expect("invoice store poisoned");
        match rows.get(&new.invoice_id) {
            Some(current) if current.status == expected_status => {
                rows.insert(new.invoice_id, new.clone());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound),
        }
    }

    async fn list_payment_timeouts_due(&self, now: DateTime<Utc>) -> Result<Vec<Invoice>, StoreError> {
        Ok(self
            .rows
            .lock()
            .expect("invoice store poisoned")
            .values()
            .filter(|inv| {
                inv.status == crate::models::InvoiceStatus::PaymentProcessing
                    && inv.payment_timeout_at.map(|t| t <= now).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn list_active_for_customer(&self, customer_id: &str) -> Result<Vec<Invoice>, StoreError> {
        use crate::models::InvoiceStatus;
        Ok(self
            .rows
            .lock()
            .expect("invoice store poisoned")
            .values()
            .filter(|inv| {
                inv.customer_id == customer_id
                    && matches!(inv.status, InvoiceStatus::Pending | InvoiceStatus::Processing)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InvoiceStatus, LineItem};
    use rust_decimal_macros::dec;

    fn sample() -> Invoice {
        Invoice::new(
            "tenant-a".to_string(),
            "cust-1".to_string(),
            "cust-1@example.com".to_string(),
            vec![LineItem {
                product_id: "sku-1".to_string(),
                quantity: 1,
                unit_price: dec!(5.00),
            }],
        )
    }

    #[tokio::test]
    async fn test_replace_fails_when_predicate_stale() {
        let store = InMemoryInvoiceStore::new();
        let invoice = sample();
        store.insert(&invoice).await.unwrap();

        let mut moved = invoice.clone();
        moved.status = InvoiceStatus::Processing;
        assert!(store.replace(InvoiceStatus::Pending, &moved).await.unwrap());

        // Someone else already advanced it; a second writer's stale-read
        // based replace must be rejected rather than clobbering state.
        let mut stale_write = invoice.clone();
        stale_write.status = InvoiceStatus::Cancelled;
        assert!(!store
            .replace(InvoiceStatus::Pending, &stale_write)
            .await
            .unwrap());

        let current = store.get(invoice.invoice_id).await.unwrap().unwrap();
        assert_eq!(current.status, InvoiceStatus::Processing);
    }

    #[tokio::test]
    async fn test_list_active_for_customer_excludes_terminal() {
        let store = InMemoryInvoiceStore::new();
        let active = sample();
        let mut done = sample();
        done.customer_id = active.customer_id.clone();
        done.status = InvoiceStatus::Completed;
        store.insert(&active).await.unwrap();
        store.insert(&done).await.unwrap();

        let found = store.list_active_for_customer(&active.customer_id).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].invoice_id, active.invoice_id);
    }

    /// spec.md §4.6's billing veto rule is narrower than "non-terminal": an
    /// invoice already in `PAYMENT_PROCESSING` does not block a deletion,
    /// only `PENDING`/`PROCESSING` do.
    #[tokio::test]
    async fn test_list_active_for_customer_excludes_payment_processing() {
        let store = InMemoryInvoiceStore::new();
        let pending = sample();
        let mut awaiting_payment = sample();
        awaiting_payment.customer_id = pending.customer_id.clone();
        awaiting_payment.status = InvoiceStatus::PaymentProcessing;
        store.insert(&pending).await.unwrap();
        store.insert(&awaiting_payment).await.unwrap();

        let found = store.list_active_for_customer(&pending.customer_id).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].invoice_id, pending.invoice_id);
    }

    #[tokio::test]
    async fn test_list_payment_timeouts_due() {
        let store = InMemoryInvoiceStore::new();
        let mut invoice = sample();
        invoice.status = InvoiceStatus::PaymentProcessing;
        invoice.payment_timeout_at = Some(Utc::now() - chrono::Duration::seconds(1));
        store.insert(&invoice).await.unwrap();

        let due = store.list_payment_timeouts_due(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].invoice_id, invoice.invoice_id);
    }
}
