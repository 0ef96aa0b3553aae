//! Customer data model.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CustomerStatus {
    Active,
    Inactive,
    PendingDeletion,
    Deleted,
}

/// One participant's vote in the deletion protocol, keyed by service name
/// in [`Customer::deletion_responses`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeletionResponse {
    pub can_delete: bool,
    pub blocking_reason: Option<String>,
    pub responded_at: DateTime<Utc>,
    /// `true` when this vote was synthesized by the silence timer rather
    /// than actually received from the participant.
    #[serde(default)]
    pub timeout: bool,
}

/// One entry of [`Customer::deletion_blocked_by`]: a service that vetoed
/// the deletion, and why.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockedBy {
    pub service: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub customer_id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub status: CustomerStatus,

    pub deletion_requested_at: Option<DateTime<Utc>>,
    pub deletion_timeout_at: Option<DateTime<Utc>>,
    pub deletion_responses: HashMap<String, DeletionResponse>,
    pub deletion_blocked_by: Option<Vec<BlockedBy>>,
    pub deletion_completed: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    pub fn new(customer_id: String, email: String, first_name: String, last_name: String) -> Self {
        let now = Utc::now();
        Self {
            customer_id,
            email,
            first_name,
            last_name,
            status: CustomerStatus::Active,
            deletion_requested_at: None,
            deletion_timeout_at: None,
            deletion_responses: HashMap::new(),
            deletion_blocked_by: None,
            deletion_completed: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeletionStatusResponse {
    pub customer_id: String,
    pub status: CustomerStatus,
    pub deletion_requested_at: Option<DateTime<Utc>>,
    pub deletion_timeout_at: Option<DateTime<Utc>>,
    pub deletion_responses: HashMap<String, DeletionResponse>,
    pub deletion_blocked_by: Option<Vec<BlockedBy>>,
    pub deletion_completed: bool,
}

impl From<&Customer> for DeletionStatusResponse {
    fn from(c: &Customer) -> Self {
        Self {
            customer_id: c.customer_id.clone(),
            status: c.status,
            deletion_requested_at: c.deletion_requested_at,
            deletion_timeout_at: c.deletion_timeout_at,
            deletion_responses: c.deletion_responses.clone(),
            deletion_blocked_by: c.deletion_blocked_by.clone(),
            deletion_completed: c.deletion_completed,
        }
    }
}
