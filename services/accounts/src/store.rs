//! Customer persistence.
//!
//! Mirrors `billing::store`: every mutation goes through
//! [`CustomerStore::replace`], a single-row `UPDATE ... WHERE status = $1
//! AND deletion_completed = $2` primitive. The pair `(status,
//! deletion_completed)` is the discriminator the deletion protocol actually
//! branches on (see `crate::deletion::evaluate`), so it is also the
//! optimistic-concurrency predicate: a stale writer whose read predates a
//! concurrent finalization loses the race and its effects are dropped
//! rather than double-applied.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use entity_store::StoreError;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::{Customer, CustomerStatus};

#[async_trait]
pub trait CustomerStore: Send + Sync {
    async fn insert(&self, customer: &Customer) -> Result<(), StoreError>;
    async fn get(&self, customer_id: &str) -> Result<Option<Customer>, StoreError>;

    async fn replace(
        &self,
        expected_status: CustomerStatus,
        expected_deletion_completed: bool,
        new: &Customer,
    ) -> Result<bool, StoreError>;

    /// Customers whose `deletion_timeout_at` has already passed and whose
    /// deletion has not yet been finalized. Drives both the timer wheel and
    /// the startup recovery sweep (spec.md §5 "Timers").
    async fn list_pending_deletions_past_timeout(&self, now: DateTime<Utc>) -> Result<Vec<Customer>, StoreError>;
}

pub struct PostgresCustomerStore {
    pool: PgPool,
}

impl PostgresCustomerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CustomerStore for PostgresCustomerStore {
    async fn insert(&self, customer: &Customer) -> Result<(), StoreError> {
        let responses = serde_json::to_value(&customer.deletion_responses)
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?;
        let blocked_by = serde_json::to_value(&customer.deletion_blocked_by)
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?;
        sqlx::query(
            "INSERT INTO customers
                (customer_id, email, first_name, last_name, status,
                 deletion_requested_at, deletion_timeout_at, deletion_responses,
                 deletion_blocked_by, deletion_completed, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)",
        )
        .bind(&customer.customer_id)
        .bind(&customer.email)
        .bind(&customer.first_name)
        .bind(&customer.last_name)
        .bind(customer.status)
        .bind(customer.deletion_requested_at)
        .bind(customer.deletion_timeout_at)
        .bind(responses)
        .bind(blocked_by)
        .bind(customer.deletion_completed)
        .bind(customer.created_at)
        .bind(customer.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, customer_id: &str) -> Result<Option<Customer>, StoreError> {
        let row = sqlx::query_as::<_, CustomerRow>(
            "SELECT customer_id, email, first_name, last_name, status,
                    deletion_requested_at, deletion_timeout_at, deletion_responses,
                    deletion_blocked_by, deletion_completed, created_at, updated_at
             FROM customers WHERE customer_id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn replace(
        &self,
        expected_status: CustomerStatus,
        expected_deletion_completed: bool,
        new: &Customer,
    ) -> Result<bool, StoreError> {
        let responses = serde_json::to_value(&new.deletion_responses)
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?;
        let blocked_by = serde_json::to_value(&new.deletion_blocked_by)
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?;
        let result = sqlx::query(
            "UPDATE customers SET
                status = $1, deletion_requested_at = $2, deletion_timeout_at = $3,
                deletion_responses = $4, deletion_blocked_by = $5,
                deletion_completed = $6, updated_at = $7
             WHERE customer_id = $8 AND status = $9 AND deletion_completed = $10",
        )
        .bind(new.status)
        .bind(new.deletion_requested_at)
        .bind(new.deletion_timeout_at)
        .bind(responses)
        .bind(blocked_by)
        .bind(new.deletion_completed)
        .bind(new.updated_at)
        .bind(&new.customer_id)
        .bind(expected_status)
        .bind(expected_deletion_completed)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_pending_deletions_past_timeout(&self, now: DateTime<Utc>) -> Result<Vec<Customer>, StoreError> {
        let rows = sqlx::query_as::<_, CustomerRow>(
            "SELECT customer_id, email, first_name, last_name, status,
                    deletion_requested_at, deletion_timeout_at, deletion_responses,
                    deletion_blocked_by, deletion_completed, created_at, updated_at
             FROM customers
             WHERE status = 'PENDING_DELETION' AND deletion_completed = FALSE
               AND deletion_timeout_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct CustomerRow {
    customer_id: String,
    email: String,
    first_name: String,
    last_name: String,
    status: CustomerStatus,
    deletion_requested_at: Option<DateTime<Utc>>,
    deletion_timeout_at: Option<DateTime<Utc>>,
    deletion_responses: serde_json::Value,
    deletion_blocked_by: serde_json::Value,
    deletion_completed: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CustomerRow> for Customer {
    type Error = StoreError;

    fn try_from(row: CustomerRow) -> Result<Self, StoreError> {
        Ok(Customer {
            customer_id: row.customer_id,
            email: row.email,
            first_name: row.first_name,
            last_name: row.last_name,
            status: row.status,
            deletion_requested_at: row.deletion_requested_at,
            deletion_timeout_at: row.deletion_timeout_at,
            deletion_responses: serde_json::from_value(row.deletion_responses).unwrap_or_default(),
            deletion_blocked_by: serde_json::from_value(row.deletion_blocked_by).unwrap_or_default(),
            deletion_completed: row.deletion_completed,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// In-memory store for unit and integration tests.
#[derive(Default)]
pub struct InMemoryCustomerStore {
    rows: Mutex<HashMap<String, Customer>>,
}

impl InMemoryCustomerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CustomerStore for InMemoryCustomerStore {
    async fn insert(&self, customer: &Customer) -> Result<(), StoreError> {
        self.rows
            .lock()
            .expect("customer store poisoned")
            .insert(customer.customer_id.clone(), customer.clone());
        Ok(())
    }

    async fn get(&self, customer_id: &str) -> Result<Option<Customer>, StoreError> {
        Ok(self
            .rows
            .lock()
            .expect("customer store poisoned")
            .get(customer_id)
            .cloned())
    }

    async fn replace(
        &self,
        expected_status: CustomerStatus,
        expected_deletion_completed: bool,
        new: &Customer,
    ) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().expect("customer store poisoned");
        match rows.get(&new.customer_id) {
            Some(current)
                if current.status == expected_status
                    && current.deletion_completed == expected_deletion_completed =>
            {
                rows.insert(new.customer_id.clone(), new.clone());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound),
        }
    }

    async fn list_pending_deletions_past_timeout(&self, now: DateTime<Utc>) -> Result<Vec<Customer>, StoreError> {
        Ok(self
            .rows
            .lock()
            .expect("customer store poisoned")
            .values()
            .filter(|c| {
                c.status == CustomerStatus::PendingDeletion
                    && !c.deletion_completed
                    && c.deletion_timeout_at.map(|t| t <= now).unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}
