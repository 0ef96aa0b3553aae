//! Subjects and wire payloads for inventory reservation, compensation, and
//! inventory's vote in distributed customer deletion.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use event_bus::EventEnvelope;

pub const SOURCE_MODULE: &str = "inventory";
pub const SOURCE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod subjects {
    pub const INVENTORY_RESERVATION_REQUESTED: &str = "inventory.reservation.requested";
    pub const INVENTORY_RESERVATION_RESPONDED: &str = "inventory.reservation.responded";
    pub const INVENTORY_COMPENSATION_REQUESTED: &str = "inventory.compensation.requested";
    pub const INVENTORY_COMPENSATION_RESPONDED: &str = "inventory.compensation.responded";

    pub const CUSTOMER_DELETION_REQUESTED: &str = "customer.deletion.requested";
    pub const CUSTOMER_DELETION_RESPONDED: &str = "customer.deletion.responded";
}

/// Mirrors `billing::events::envelope::LineItem`'s shape field-for-field;
/// inventory decodes billing's wire format rather than sharing the type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryReservationRequested {
    pub invoice_id: Uuid,
    pub items: Vec<LineItem>,
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
    pub items: Vec<LineItem>,
    pub reason: String,
    pub compensation_type: String,
    pub triggered_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryCompensationResponded {
    pub invoice_id: Uuid,
    pub compensation_successful: bool,
    pub error: Option<String>,
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

pub fn extract_tenant_id(envelope: &serde_json::Value) -> String {
    envelope
        .get("tenant_id")
        .and_then(|v| v.as_str())
        .unwrap_or("platform")
        .to_string()
}

pub fn extract_correlation_fields(
    envelope: &serde_json::Value,
) -> (Option<String>, Option<String>, Option<String>) {
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
