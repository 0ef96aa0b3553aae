//! Stock data model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryItem {
    pub product_id: String,
    pub name: String,
    pub quantity: i64,
    pub price: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InventoryItem {
    pub fn new(product_id: String, name: String, quantity: i64, price: Decimal) -> Self {
        let now = Utc::now();
        Self {
            product_id,
            name,
            quantity,
            price,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn available(&self) -> bool {
        self.quantity > 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InventoryItemResponse {
    pub product_id: String,
    pub name: String,
    pub quantity: i64,
    pub price: Decimal,
    pub available: bool,
}

impl From<&InventoryItem> for InventoryItemResponse {
    fn from(item: &InventoryItem) -> Self {
        Self {
            product_id: item.product_id.clone(),
            name: item.name.clone(),
            quantity: item.quantity,
            price: item.price,
            available: item.available(),
        }
    }
}
