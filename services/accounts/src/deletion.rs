//! The distributed customer-deletion decision logic.
//!
//! Mirrors `billing::saga`: every function here is a pure transition over a
//! [`Customer`] plus whatever external facts the caller supplies (the
//! expected-services set, "now"), returning the list of [`DeletionEffect`]s
//! the caller must carry out. No I/O happens in this module, which is what
//! makes the quorum/timeout interplay (including the late-response and
//! double-delivery cases) testable without a bus or a database.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::models::{BlockedBy, Customer, CustomerStatus, DeletionResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Commit,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Consensus,
    SilenceTimeout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeletionEffect {
    PublishDeletionRequest,
    PublishDeletionResult {
        decision: Decision,
        blocked_by: Option<Vec<BlockedBy>>,
    },
    PublishDeletionCompleted {
        method: Method,
    },
    StartSilenceTimeout,
    CancelSilenceTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDeletionError {
    NotFound,
    AlreadyInProgress,
    AlreadyDeleted,
}

/// `ACTIVE|INACTIVE -> PENDING_DELETION`. The caller is responsible for
/// having already confirmed the customer exists; this only checks the
/// status precondition (spec.md §4.5).
pub fn on_request_deletion(
    customer: &mut Customer,
    silence_timeout_seconds: i64,
    now: DateTime<Utc>,
) -> Result<Vec<DeletionEffect>, RequestDeletionError> {
    match customer.status {
        CustomerStatus::PendingDeletion => return Err(RequestDeletionError::AlreadyInProgress),
        CustomerStatus::Deleted => return Err(RequestDeletionError::AlreadyDeleted),
        CustomerStatus::Active | CustomerStatus::Inactive => {}
    }

    customer.status = CustomerStatus::PendingDeletion;
    customer.deletion_requested_at = Some(now);
    customer.deletion_timeout_at = Some(now + chrono::Duration::seconds(silence_timeout_seconds));
    customer.deletion_responses.clear();
    customer.deletion_blocked_by = None;
    customer.deletion_completed = false;
    customer.updated_at = now;

    Ok(vec![
        DeletionEffect::PublishDeletionRequest,
        DeletionEffect::StartSilenceTimeout,
    ])
}

/// Undo [`on_request_deletion`] when the broadcast publish itself failed
/// (spec.md §4.5, §7 taxonomy item 2: publish failure on initiation rolls
/// back).
pub fn rollback_request(customer: &mut Customer, now: DateTime<Utc>) {
    customer.status = CustomerStatus::Active;
    customer.deletion_requested_at = None;
    customer.deletion_timeout_at = None;
    customer.deletion_responses.clear();
    customer.updated_at = now;
}

/// Record one participant's vote, then re-run [`evaluate`]. Returns an
/// empty effect list (and leaves the customer otherwise unchanged) if the
/// vote arrives outside `PENDING_DELETION` — a late or duplicate delivery
/// after the deletion has already been finalized one way or the other.
pub fn on_deletion_response(
    customer: &mut Customer,
    service: &str,
    can_delete: bool,
    blocking_reason: Option<String>,
    expected_services: &[String],
    now: DateTime<Utc>,
) -> Vec<DeletionEffect> {
    if customer.status != CustomerStatus::PendingDeletion || customer.deletion_completed {
        return Vec::new();
    }

    customer.deletion_responses.insert(
        service.to_string(),
        DeletionResponse {
            can_delete,
            blocking_reason,
            responded_at: now,
            timeout: false,
        },
    );
    customer.updated_at = now;

    evaluate(customer, expected_services, now)
}

/// Fired by the timer wheel when the silence window has elapsed. Re-runs
/// [`evaluate`] with synthetic timeout votes injected for every service
/// that never responded (spec.md §4.5 rule 3 / SilenceTimeout).
pub fn on_silence_timeout(
    customer: &mut Customer,
    expected_services: &[String],
    now: DateTime<Utc>,
) -> Vec<DeletionEffect> {
    if customer.status != CustomerStatus::PendingDeletion || customer.deletion_completed {
        return Vec::new();
    }
    evaluate_with_timeout_injection(customer, expected_services, now)
}

/// `Evaluate(customer)` from spec.md §4.5: finalize CANCEL on any veto,
/// finalize COMMIT once every expected service has voted true, otherwise
/// check whether the silence deadline has already passed (covers the case
/// where a response arrives after `deletion_timeout_at` but before the
/// timer has actually fired) and finalize with synthetic votes if so.
fn evaluate(customer: &mut Customer, expected_services: &[String], now: DateTime<Utc>) -> Vec<DeletionEffect> {
    if let Some(effects) = try_finalize(customer, now) {
        return effects;
    }

    let expected: HashSet<&str> = expected_services.iter().map(String::as_str).collect();
    let responded: HashSet<&str> = customer.deletion_responses.keys().map(String::as_str).collect();
    if expected.is_subset(&responded) {
        return finalize_commit(customer, Method::Consensus, now);
    }

    if customer
        .deletion_timeout_at
        .map(|deadline| now >= deadline)
        .unwrap_or(false)
    {
        return evaluate_with_timeout_injection(customer, expected_services, now);
    }

    Vec::new()
}

fn evaluate_with_timeout_injection(
    customer: &mut Customer,
    expected_services: &[String],
    now: DateTime<Utc>,
) -> Vec<DeletionEffect> {
    for service in expected_services {
        customer.deletion_responses.entry(service.clone()).or_insert(DeletionResponse {
            can_delete: true,
            blocking_reason: None,
            responded_at: now,
            timeout: true,
        });
    }
    customer.updated_at = now;

    if let Some(effects) = try_finalize(customer, now) {
        return effects;
    }
    // No false vote is possible at this point (try_finalize would have
    // caught it), so every expected service now has a true vote.
    finalize_commit(customer, Method::SilenceTimeout, now)
}

/// Rule 1: any recorded veto finalizes CANCEL immediately, regardless of
/// whether every service has responded yet.
fn try_finalize(customer: &mut Customer, now: DateTime<Utc>) -> Option<Vec<DeletionEffect>> {
    let blocked_by: Vec<BlockedBy> = customer
        .deletion_responses
        .iter()
        .filter(|(_, r)| !r.can_delete)
        .map(|(service, r)| BlockedBy {
            service: service.clone(),
            reason: r.blocking_reason.clone().unwrap_or_else(|| "blocked".to_string()),
        })
        .collect();

    if blocked_by.is_empty() {
        return None;
    }

    customer.status = CustomerStatus::Active;
    customer.deletion_blocked_by = Some(blocked_by.clone());
    customer.deletion_completed = true;
    customer.deletion_requested_at = None;
    customer.updated_at = now;

    Some(vec![
        DeletionEffect::CancelSilenceTimeout,
        DeletionEffect::PublishDeletionResult {
            decision: Decision::Cancel,
            blocked_by: Some(blocked_by),
        },
    ])
}

fn finalize_commit(customer: &mut Customer, method: Method, now: DateTime<Utc>) -> Vec<DeletionEffect> {
    customer.status = CustomerStatus::Deleted;
    customer.deletion_completed = true;
    customer.updated_at = now;

    vec![
        DeletionEffect::CancelSilenceTimeout,
        DeletionEffect::PublishDeletionResult {
            decision: Decision::Commit,
            blocked_by: None,
        },
        DeletionEffect::PublishDeletionCompleted { method },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Customer {
        Customer::new(
            "cust-1".to_string(),
            "a@example.com".to_string(),
            "Ada".to_string(),
            "Lovelace".to_string(),
        )
    }

    fn services() -> Vec<String> {
        vec!["billing".to_string(), "inventory".to_string(), "payment".to_string()]
    }

    #[test]
    fn test_request_deletion_moves_to_pending_and_fires_broadcast() {
        let mut c = sample();
        let now = Utc::now();
        let effects = on_request_deletion(&mut c, 60, now).unwrap();
        assert_eq!(c.status, CustomerStatus::PendingDeletion);
        assert_eq!(c.deletion_timeout_at, Some(now + chrono::Duration::seconds(60)));
        assert!(effects.contains(&DeletionEffect::PublishDeletionRequest));
        assert!(effects.contains(&DeletionEffect::StartSilenceTimeout));
    }

    #[test]
    fn test_request_deletion_rejects_when_already_pending() {
        let mut c = sample();
        on_request_deletion(&mut c, 60, Utc::now()).unwrap();
        assert_eq!(
            on_request_deletion(&mut c, 60, Utc::now()),
            Err(RequestDeletionError::AlreadyInProgress)
        );
    }

    #[test]
    fn test_request_deletion_rejects_when_already_deleted() {
        let mut c = sample();
        c.status = CustomerStatus::Deleted;
        assert_eq!(
            on_request_deletion(&mut c, 60, Utc::now()),
            Err(RequestDeletionError::AlreadyDeleted)
        );
    }

    #[test]
    fn test_rollback_restores_active_and_clears_fields() {
        let mut c = sample();
        let now = Utc::now();
        on_request_deletion(&mut c, 60, now).unwrap();
        rollback_request(&mut c, now);
        assert_eq!(c.status, CustomerStatus::Active);
        assert!(c.deletion_requested_at.is_none());
        assert!(c.deletion_timeout_at.is_none());
    }

    #[test]
    fn test_unanimous_consent_commits_by_consensus() {
        let mut c = sample();
        let now = Utc::now();
        on_request_deletion(&mut c, 60, now).unwrap();

        assert!(on_deletion_response(&mut c, "billing", true, None, &services(), now).is_empty());
        assert!(on_deletion_response(&mut c, "inventory", true, None, &services(), now).is_empty());
        let effects = on_deletion_response(&mut c, "payment", true, None, &services(), now);

        assert_eq!(c.status, CustomerStatus::Deleted);
        assert!(effects.contains(&DeletionEffect::PublishDeletionCompleted { method: Method::Consensus }));
    }

    #[test]
    fn test_any_veto_cancels_even_before_all_responses_arrive() {
        let mut c = sample();
        let now = Utc::now();
        on_request_deletion(&mut c, 60, now).unwrap();

        let effects = on_deletion_response(
            &mut c,
            "billing",
            false,
            Some("active invoice".to_string()),
            &services(),
            now,
        );

        assert_eq!(c.status, CustomerStatus::Active);
        assert_eq!(
            c.deletion_blocked_by,
            Some(vec![BlockedBy {
                service: "billing".to_string(),
                reason: "active invoice".to_string()
            }])
        );
        assert!(effects
            .iter()
            .any(|e| matches!(e, DeletionEffect::PublishDeletionResult { decision: Decision::Cancel, .. })));
        assert!(c.deletion_requested_at.is_none());
    }

    #[test]
    fn test_veto_after_some_approvals_still_cancels() {
        let mut c = sample();
        let now = Utc::now();
        on_request_deletion(&mut c, 60, now).unwrap();
        on_deletion_response(&mut c, "inventory", true, None, &services(), now);
        let effects = on_deletion_response(&mut c, "billing", false, Some("active invoice".to_string()), &services(), now);
        assert_eq!(c.status, CustomerStatus::Active);
        assert!(effects
            .iter()
            .any(|e| matches!(e, DeletionEffect::PublishDeletionResult { decision: Decision::Cancel, .. })));
    }

    #[test]
    fn test_total_silence_commits_with_synthetic_votes() {
        let mut c = sample();
        let now = Utc::now();
        on_request_deletion(&mut c, 60, now).unwrap();

        let later = now + chrono::Duration::seconds(61);
        let effects = on_silence_timeout(&mut c, &services(), later);

        assert_eq!(c.status, CustomerStatus::Deleted);
        assert_eq!(c.deletion_responses.len(), 3);
        assert!(c.deletion_responses.values().all(|r| r.timeout));
        assert!(effects.contains(&DeletionEffect::PublishDeletionCompleted { method: Method::SilenceTimeout }));
    }

    #[test]
    fn test_partial_silence_commits_with_synthetic_votes_for_missing_only() {
        let mut c = sample();
        let now = Utc::now();
        on_request_deletion(&mut c, 60, now).unwrap();
        on_deletion_response(&mut c, "inventory", true, None, &services(), now);

        let later = now + chrono::Duration::seconds(61);
        let effects = on_silence_timeout(&mut c, &services(), later);

        assert_eq!(c.status, CustomerStatus::Deleted);
        assert!(!c.deletion_responses["inventory"].timeout);
        assert!(c.deletion_responses["billing"].timeout);
        assert!(c.deletion_responses["payment"].timeout);
        assert!(effects.contains(&DeletionEffect::PublishDeletionCompleted { method: Method::SilenceTimeout }));
    }

    #[test]
    fn test_silence_timeout_never_overrides_an_already_recorded_veto() {
        let mut c = sample();
        let now = Utc::now();
        on_request_deletion(&mut c, 60, now).unwrap();
        on_deletion_response(&mut c, "billing", false, Some("active invoice".to_string()), &services(), now);
        assert_eq!(c.status, CustomerStatus::Active);

        // The timer fires after finalization already happened; must be a no-op.
        let later = now + chrono::Duration::seconds(61);
        let effects = on_silence_timeout(&mut c, &services(), later);
        assert!(effects.is_empty());
        assert_eq!(c.status, CustomerStatus::Active);
    }

    #[test]
    fn test_late_response_after_finalization_is_neutral() {
        let mut c = sample();
        let now = Utc::now();
        on_request_deletion(&mut c, 60, now).unwrap();
        on_deletion_response(&mut c, "billing", true, None, &services(), now);
        on_deletion_response(&mut c, "inventory", true, None, &services(), now);
        on_deletion_response(&mut c, "payment", true, None, &services(), now);
        assert_eq!(c.status, CustomerStatus::Deleted);

        let effects = on_deletion_response(&mut c, "billing", false, Some("too late".to_string()), &services(), now);
        assert!(effects.is_empty());
        assert_eq!(c.status, CustomerStatus::Deleted);
    }

    #[test]
    fn test_response_arriving_past_deadline_before_timer_fires_still_finalizes() {
        let mut c = sample();
        let now = Utc::now();
        on_request_deletion(&mut c, 60, now).unwrap();
        on_deletion_response(&mut c, "inventory", true, None, &services(), now);

        let past_deadline = now + chrono::Duration::seconds(120);
        let effects = on_deletion_response(&mut c, "payment", true, None, &services(), past_deadline);

        assert_eq!(c.status, CustomerStatus::Deleted);
        assert!(c.deletion_responses["billing"].timeout);
        assert!(effects.contains(&DeletionEffect::PublishDeletionCompleted { method: Method::SilenceTimeout }));
    }
}
