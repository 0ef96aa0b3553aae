//! Invoice data model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Pending,
    Processing,
    PaymentProcessing,
    Completed,
    Failed,
    Cancelled,
}

impl InvoiceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InvoiceStatus::Completed | InvoiceStatus::Failed | InvoiceStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: String,
    pub quantity: u32,
    pub unit_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: Uuid,
    /// Unique printable identifier (spec.md §3), distinct from the opaque
    /// `invoice_id` primary key — this is what a human-facing note or
    /// receipt would cite.
    pub invoice_number: String,
    pub tenant_id: String,
    pub customer_id: String,
    pub customer_email: String,
    pub items: Vec<LineItem>,
    pub total_amount: Decimal,
    pub status: InvoiceStatus,
    pub inventory_status: SubStatus,
    pub customer_status: SubStatus,
    pub payment_status: SubStatus,
    pub failure_reason: Option<String>,
    pub payment_timeout_at: Option<DateTime<Utc>>,
    /// Append-only narrative (spec.md §3): records late or duplicate events
    /// against a terminal invoice without disturbing `status` or the typed
    /// per-stage fields above. Never truncated, never rewritten in place.
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    pub fn new(
        tenant_id: String,
        customer_id: String,
        customer_email: String,
        items: Vec<LineItem>,
    ) -> Self {
        let total_amount = items
            .iter()
            .map(|i| i.unit_price * Decimal::from(i.quantity))
            .sum();
        let now = Utc::now();
        let invoice_id = Uuid::new_v4();
        Self {
            invoice_id,
            invoice_number: format!("INV-{}", invoice_id.as_simple()),
            tenant_id,
            customer_id,
            customer_email,
            items,
            total_amount,
            status: InvoiceStatus::Pending,
            inventory_status: SubStatus::Pending,
            customer_status: SubStatus::Pending,
            payment_status: SubStatus::Pending,
            failure_reason: None,
            payment_timeout_at: None,
            notes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a late, duplicate, or otherwise ignored event without
    /// changing `status` (spec.md §4.3: "the corresponding per-stage
    /// string is updated to record the late arrival").
    pub fn note(&mut self, message: impl Into<String>) {
        self.notes.push(message.into());
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInvoiceRequest {
    pub tenant_id: String,
    pub customer_id: String,
    pub customer_email: String,
    pub items: Vec<LineItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvoiceResponse {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub status: InvoiceStatus,
    pub total_amount: Decimal,
    pub failure_reason: Option<String>,
    pub notes: Vec<String>,
}

impl From<&Invoice> for InvoiceResponse {
    fn from(invoice: &Invoice) -> Self {
        Self {
            invoice_id: invoice.invoice_id,
            invoice_number: invoice.invoice_number.clone(),
            status: invoice.status,
            total_amount: invoice.total_amount,
            failure_reason: invoice.failure_reason.clone(),
            notes: invoice.notes.clone(),
        }
    }
}
