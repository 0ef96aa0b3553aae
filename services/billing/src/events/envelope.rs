//! Subjects and wire payloads for the invoice saga and the billing
//! component's part in distributed customer deletion.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use event_bus::EventEnvelope;

pub const SOURCE_MODULE: &str = "billing";
pub const SOURCE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod subjects {
    pub const INVOICE_CREATED: &str = "billing.invoice.created";
    pub const INVOICE_COMPLETED: &str = "billing.invoice.completed";
    pub const INVOICE_FAILED: &str = "billing.invoice.failed";
    pub const INVOICE_CANCELLED: &str = "billing.invoice.cancelled";

    pub const INVENTORY_RESERVATION_REQUESTED: &str = "inventory.reservation.requested";
    pub const INVENTORY_RESERVATION_RESPONDED: &str = "inventory.reservation.responded";
    pub const INVENTORY_COMPENSATION_REQUESTED: &str = "inventory.compensation.requested";
    pub const INVENTORY_COMPENSATION_RESPONDED: &str = "inventory.compensation.responded";

    pub const CUSTOMER_VERIFICATION_REQUESTED: &str = "customer.verification.requested";
    pub const CUSTOMER_VERIFICATION_RESPONDED: &str = "customer.verification.responded";

    pub const PAYMENT_AUTHORIZATION_REQUESTED: &str = "payment.authorization.requested";
    pub const PAYMENT_AUTHORIZATION_SUCCEEDED: &str = "payment.authorization.succeeded";
    pub const PAYMENT_AUTHORIZATION_FAILED: &str = "payment.authorization.failed";

    pub const CUSTOMER_DELETION_REQUESTED: &str = "customer.deletion.requested";
    pub const CUSTOMER_DELETION_RESPONDED: &str = "customer.deletion.responded";
    pub const CUSTOMER_DELETION_COMPLETED: &str = "customer.deletion.completed";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryReservationRequested {
    pub invoice_id: Uuid,
    pub items: Vec<crate::models::LineItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryReservationResponded {
    pub invoice_id: Uuid,
    pub approved: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryCompensationRequested {
    pub invoice_id: Uuid,
    pub items: Vec<crate::models::LineItem>,
    pub reason: String,
    pub compensation_type: String,
    pub triggered_by: String,
}

/// Inventory's confirmation that a compensation request was applied.
/// Billing only narrates this (spec.md §4.7): the invoice is already
/// terminal by the time compensation runs, so no status transition
/// results from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryCompensationResponded {
    pub invoice_id: Uuid,
    pub compensation_successful: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerVerificationRequested {
    pub invoice_id: Uuid,
    pub customer_id: String,
    pub customer_email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerVerificationResponded {
    pub invoice_id: Uuid,
    pub approved: bool,
    pub errored: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAuthorizationRequested {
    pub invoice_id: Uuid,
    pub amount: rust_decimal::Decimal,
    pub customer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAuthorizationSucceeded {
    pub invoice_id: Uuid,
    pub payment_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAuthorizationFailed {
    pub invoice_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceTerminalEvent {
    pub invoice_id: Uuid,
    pub status: crate::models::InvoiceStatus,
    pub reason: Option<String>,
}

/// Billing's vote in the distributed customer deletion protocol: active,
/// non-terminal invoices veto the deletion outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerDeletionRequested {
    pub customer_id: String,
    pub expected_services: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionVote {
    Approve,
    Veto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerDeletionResponded {
    pub customer_id: String,
    pub service: String,
    pub vote: DeletionVote,
    pub reason: Option<String>,
}

/// Build an outgoing envelope with billing's own module identity, carrying
/// the correlation id of whatever triggered this publish forward so every
/// event in a saga shares one trace.
pub fn build_envelope<T: Serialize>(
    tenant_id: &str,
    correlation_id: Option<String>,
    causation_id: Option<String>,
    payload: T,
) -> EventEnvelope<T> {
    EventEnvelope::new(tenant_id.to_string(), SOURCE_MODULE.to_string(), payload)
        .with_source_version(SOURCE_VERSION.to_string())
        .with_correlation_id(correlation_id)
        .with_causation_id(causation_id)
}

/// Pull the fields every inbound consumer needs regardless of which
/// upstream producer's field-naming convention it used.
pub fn extract_correlation_fields(envelope: &Value) -> (Option<String>, Option<String>, Option<String>) {
    let correlation_id = envelope
        .get("correlation_id")
        .or_else(|| envelope.get("trace_id"))
        .and_then(|v| v.as_str())
        .map(String::from);
    let source_module = envelope
        .get("source_module")
        .or_else(|| envelope.get("producer"))
        .and_then(|v| v.as_str())
        .map(String::from);
    let event_id = envelope
        .get("event_id")
        .and_then(|v| v.as_str())
        .map(String::from);
    (correlation_id, source_module, event_id)
}
