//! Stock persistence.
//!
//! Unlike `billing::store`/`accounts::store`, reservation and restock are
//! not a read-modify-CAS-write over an FSM column — they are a single
//! atomic delta applied directly in SQL (`quantity = quantity - $n WHERE
//! quantity >= $n`, `quantity = quantity + $n`), since stock has no status
//! column to branch on. The same single-row-update discipline still
//! applies: every mutation is one statement that either affects exactly
//! one row or none.

use async_trait::async_trait;
use entity_store::StoreError;
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::InventoryItem;

#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn insert(&self, item: &InventoryItem) -> Result<(), StoreError>;
    async fn get(&self, product_id: &str) -> Result<Option<InventoryItem>, StoreError>;

    /// Atomically decrements `quantity` by `amount` if at least `amount`
    /// units are in stock. Returns the updated row, or `None` if the
    /// product is missing or stock is insufficient.
    async fn try_reserve(&self, product_id: &str, amount: i64) -> Result<Option<InventoryItem>, StoreError>;

    /// Atomically increments `quantity` by `amount`. Returns the updated
    /// row, or `None` if the product is missing.
    async fn restore(&self, product_id: &str, amount: i64) -> Result<Option<InventoryItem>, StoreError>;
}

pub struct PostgresInventoryStore {
    pool: PgPool,
}

impl PostgresInventoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InventoryStore for PostgresInventoryStore {
    async fn insert(&self, item: &InventoryItem) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO inventory_items (product_id, name, quantity, price, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&item.product_id)
        .bind(&item.name)
        .bind(item.quantity)
        .bind(item.price)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, product_id: &str) -> Result<Option<InventoryItem>, StoreError> {
        let row = sqlx::query_as::<_, InventoryItemRow>(
            "SELECT product_id, name, quantity, price, created_at, updated_at
             FROM inventory_items WHERE product_id = $1",
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn try_reserve(&self, product_id: &str, amount: i64) -> Result<Option<InventoryItem>, StoreError> {
        let row = sqlx::query_as::<_, InventoryItemRow>(
            "UPDATE inventory_items
             SET quantity = quantity - $1, updated_at = NOW()
             WHERE product_id = $2 AND quantity >= $1
             RETURNING product_id, name, quantity, price, created_at, updated_at",
        )
        .bind(amount)
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn restore(&self, product_id: &str, amount: i64) -> Result<Option<InventoryItem>, StoreError> {
        let row = sqlx::query_as::<_, InventoryItemRow>(
            "UPDATE inventory_items
             SET quantity = quantity + $1, updated_at = NOW()
             WHERE product_id = $2
             RETURNING product_id, name, quantity, price, created_at, updated_at",
        )
        .bind(amount)
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }
}

#[derive(sqlx::FromRow)]
struct InventoryItemRow {
    product_id: String,
    name: String,
    quantity: i64,
    price: Decimal,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<InventoryItemRow> for InventoryItem {
    fn from(row: InventoryItemRow) -> Self {
        InventoryItem {
            product_id: row.product_id,
            name: row.name,
            quantity: row.quantity,
            price: row.price,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// In-memory store for unit and integration tests.
#[derive(Default)]
pub struct InMemoryInventoryStore {
    rows: Mutex<HashMap<String, InventoryItem>>,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn insert(&self, item: &InventoryItem) -> Result<(), StoreError> {
        self.rows
            .lock()
            .expect("inventory store poisoned")
            .insert(item.product_id.clone(), item.clone());
        Ok(())
    }

    async fn get(&self, product_id: &str) -> Result<Option<InventoryItem>, StoreError> {
        Ok(self
            .rows
            .lock()
            .expect("inventory store poisoned")
            .get(product_id)
            .cloned())
    }

    async fn try_reserve(&self, product_id: &str, amount: i64) -> Result<Option<InventoryItem>, StoreError> {
        let mut rows = self.rows.lock().expect("inventory store poisoned");
        let Some(item) = rows.get_mut(product_id) else {
            return Ok(None);
        };
        if item.quantity < amount {
            return Ok(None);
        }
        item.quantity -= amount;
        item.updated_at = chrono::Utc::now();
        Ok(Some(item.clone()))
    }

    async fn restore(&self, product_id: &str, amount: i64) -> Result<Option<InventoryItem>, StoreError> {
        let mut rows = self.rows.lock().expect("inventory store poisoned");
        let Some(item) = rows.get_mut(product_id) else {
            return Ok(None);
        };
        item.quantity += amount;
        item.updated_at = chrono::Utc::now();
        Ok(Some(item.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample() -> InventoryItem {
        InventoryItem::new("prod-1".to_string(), "Widget".to_string(), 5, dec!(10.00))
    }

    #[tokio::test]
    async fn test_try_reserve_decrements_when_sufficient() {
        let store = InMemoryInventoryStore::new();
        store.insert(&sample()).await.unwrap();

        let updated = store.try_reserve("prod-1", 2).await.unwrap().unwrap();
        assert_eq!(updated.quantity, 3);
    }

    #[tokio::test]
    async fn test_try_reserve_rejects_when_insufficient() {
        let store = InMemoryInventoryStore::new();
        store.insert(&sample()).await.unwrap();

        let result = store.try_reserve("prod-1", 10).await.unwrap();
        assert!(result.is_none());
        let item = store.get("prod-1").await.unwrap().unwrap();
        assert_eq!(item.quantity, 5);
    }

    #[tokio::test]
    async fn test_restore_increments_quantity() {
        let store = InMemoryInventoryStore::new();
        store.insert(&sample()).await.unwrap();
        store.try_reserve("prod-1", 2).await.unwrap();

        let restored = store.restore("prod-1", 2).await.unwrap().unwrap();
        assert_eq!(restored.quantity, 5);
    }

    #[tokio::test]
    async fn test_try_reserve_missing_product_is_none() {
        let store = InMemoryInventoryStore::new();
        let result = store.try_reserve("does-not-exist", 1).await.unwrap();
        assert!(result.is_none());
    }
}
