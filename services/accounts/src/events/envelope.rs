//! Subjects and wire payloads for the distributed customer-deletion
//! protocol, from the coordinator's (accounts) side, plus the
//! customer-verification leg of the invoice saga accounts services for
//! billing.
//!
//! [`CustomerDeletionResponded`] mirrors the wire shape billing, inventory
//! and payments each publish their vote with: `service` / `vote` /
//! `reason`, not this crate's own `can_delete` naming. `DeletionVote` is
//! kept distinct from [`crate::deletion::Decision`] for the same reason
//! billing keeps its own copy of it — each service is free to have its own
//! notion of the coordinator's final verdict while they all still agree on
//! how a participant casts one. [`CustomerVerificationRequested`]/
//! [`CustomerVerificationResponded`] mirror `billing::events::envelope`'s
//! copies the same way.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use event_bus::EventEnvelope;

use crate::deletion::Method;

pub const SOURCE_MODULE: &str = "accounts";
pub const SOURCE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod subjects {
    pub const CUSTOMER_DELETION_REQUESTED: &str = "customer.deletion.requested";
    pub const CUSTOMER_DELETION_RESPONDED: &str = "customer.deletion.responded";
    pub const CUSTOMER_DELETION_RESULT: &str = "customer.deletion.result";
    pub const CUSTOMER_DELETION_COMPLETED: &str = "customer.deletion.completed";

    pub const CUSTOMER_VERIFICATION_REQUESTED: &str = "customer.verification.requested";
    pub const CUSTOMER_VERIFICATION_RESPONDED: &str = "customer.verification.responded";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerVerificationRequested {
    pub invoice_id: Uuid,
    pub customer_id: String,
    #[serde(default)]
    pub customer_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerVerificationResponded {
    pub invoice_id: Uuid,
    pub approved: bool,
    pub errored: bool,
    pub reason: Option<String>,
}

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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionOutcome {
    Commit,
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerDeletionResult {
    pub customer_id: String,
    pub outcome: DeletionOutcome,
    pub blocked_by: Option<Vec<crate::models::BlockedBy>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerDeletionCompleted {
    pub customer_id: String,
    pub method: Method,
}

/// Build an outgoing envelope with accounts' own module identity, carrying
/// the correlation id of whatever triggered this publish forward so every
/// event in the deletion protocol shares one trace.
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
