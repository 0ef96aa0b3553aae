//! Ties the deletion decision FSM to storage, the outbox and the silence
//! timer wheel.
//!
//! Mirrors `billing::handlers::BillingService`: every entry point — HTTP or
//! event-triggered — locks the customer, loads it, applies one
//! `crate::deletion` transition, writes the result back with an optimistic
//! predicate, then carries out whatever effects came back. Locking plus the
//! predicate mean a duplicate delivery or a race between two inbound votes
//! for the same customer can't double-publish.

use std::sync::Arc;

use chrono::Utc;
use entity_store::EntityLocks;
use tracing::{info, warn};

use uuid::Uuid;

use crate::deletion::{self, DeletionEffect};
use crate::error::AccountsError;
use crate::events::envelope::{
    self, subjects, CustomerDeletionCompleted, CustomerDeletionRequested, CustomerDeletionResult,
    CustomerVerificationResponded, DeletionOutcome,
};
use crate::events::outbox::Outbox;
use crate::models::{Customer, CustomerStatus, DeletionStatusResponse};
use crate::store::CustomerStore;
use crate::timers::TimerWheel;

const MAX_CAS_ATTEMPTS: u32 = 5;
const TENANT_ID: &str = "platform";

pub struct AccountsService {
    pub store: Arc<dyn CustomerStore>,
    pub outbox: Arc<dyn Outbox>,
    pub locks: Arc<EntityLocks<String>>,
    pub timers: Arc<TimerWheel>,
    pub expected_services: Vec<String>,
    pub silence_timeout_seconds: i64,
}

impl AccountsService {
    pub fn new(
        store: Arc<dyn CustomerStore>,
        outbox: Arc<dyn Outbox>,
        timers: Arc<TimerWheel>,
        expected_services: Vec<String>,
        silence_timeout_seconds: i64,
    ) -> Self {
        Self {
            store,
            outbox,
            locks: Arc::new(EntityLocks::new()),
            timers,
            expected_services,
            silence_timeout_seconds,
        }
    }

    pub async fn create_customer(&self, customer: Customer) -> Result<(), AccountsError> {
        self.store.insert(&customer).await?;
        Ok(())
    }

    pub async fn get_customer(&self, customer_id: &str) -> Result<Customer, AccountsError> {
        self.store
            .get(customer_id)
            .await?
            .ok_or(AccountsError::NotFound)
    }

    pub async fn deletion_status(&self, customer_id: &str) -> Result<DeletionStatusResponse, AccountsError> {
        let customer = self.get_customer(customer_id).await?;
        Ok(DeletionStatusResponse::from(&customer))
    }

    /// Test-only fixture (spec.md §6): puts a customer back to `ACTIVE` with
    /// its deletion state cleared, bypassing the protocol entirely.
    pub async fn reset_deletion(&self, customer_id: &str) -> Result<(), AccountsError> {
        let locks = self.locks.clone();
        let store = self.store.clone();
        let id = customer_id.to_string();

        self.timers.cancel(customer_id);
        locks
            .with_lock(&id, || async move {
                let mut attempts = 0;
                loop {
                    let current = store.get(&id).await?.ok_or(AccountsError::NotFound)?;
                    let expected_status = current.status;
                    let expected_completed = current.deletion_completed;
                    let mut reset = current;
                    reset.status = CustomerStatus::Active;
                    reset.deletion_requested_at = None;
                    reset.deletion_timeout_at = None;
                    reset.deletion_responses.clear();
                    reset.deletion_blocked_by = None;
                    reset.deletion_completed = false;
                    reset.updated_at = Utc::now();

                    if store.replace(expected_status, expected_completed, &reset).await? {
                        return Ok(());
                    }
                    attempts += 1;
                    if attempts >= MAX_CAS_ATTEMPTS {
                        return Err(AccountsError::InvalidRequest(
                            "too much contention resetting customer".to_string(),
                        ));
                    }
                }
            })
            .await
    }

    pub async fn request_deletion(&self, customer_id: &str) -> Result<DeletionStatusResponse, AccountsError> {
        self.get_customer(customer_id).await?;

        let silence_timeout_seconds = self.silence_timeout_seconds;
        let (customer, effects) = self
            .transition(customer_id, |customer, now| {
                deletion::on_request_deletion(customer, silence_timeout_seconds, now).map_err(AccountsError::from)
            })
            .await?;

        if let Err(e) = self.apply_effects(&customer, effects, None).await {
            warn!(customer_id, error = %e, "rolling back deletion request after broadcast publish failed");
            self.rollback(customer_id).await?;
            return Err(e);
        }

        Ok(DeletionStatusResponse::from(&customer))
    }

    pub async fn handle_deletion_response(
        &self,
        customer_id: &str,
        service: &str,
        can_delete: bool,
        blocking_reason: Option<String>,
        correlation_id: Option<String>,
    ) -> Result<(), AccountsError> {
        let expected = self.expected_services.clone();
        let (customer, effects) = self
            .transition(customer_id, |customer, now| {
                Ok(deletion::on_deletion_response(
                    customer,
                    service,
                    can_delete,
                    blocking_reason.clone(),
                    &expected,
                    now,
                ))
            })
            .await?;

        self.apply_effects(&customer, effects, correlation_id).await
    }

    /// Services billing's `customer-check` leg of the invoice saga
    /// (spec.md §4.4 `OnCustomerResponse`'s upstream producer): an unknown
    /// `customer_id` is provisioned on the spot rather than rejected,
    /// mirroring the source account service's "verify, else create"
    /// behavior. `customer_email` is the real address billing carries on
    /// the invoice; it is used verbatim for provisioning and only a
    /// missing/empty value falls back to a generated placeholder address
    /// (`original_source/account_service/app/main.py`:
    /// `customer_email or f"{customer_id}@generated.com"`). Only a store
    /// failure on that provisioning counts as an `errored` response — an
    /// already-known or freshly-created customer is always `approved`.
    pub async fn handle_customer_verification(
        &self,
        invoice_id: Uuid,
        customer_id: &str,
        customer_email: Option<String>,
        correlation_id: Option<String>,
    ) -> Result<(), AccountsError> {
        let response = match self.store.get(customer_id).await {
            Ok(Some(_)) => CustomerVerificationResponded {
                invoice_id,
                approved: true,
                errored: false,
                reason: None,
            },
            Ok(None) => {
                let email = customer_email
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| format!("{customer_id}@generated.invalid"));
                let generated = Customer::new(
                    customer_id.to_string(),
                    email,
                    "Generated".to_string(),
                    "Customer".to_string(),
                );
                match self.store.insert(&generated).await {
                    Ok(()) => CustomerVerificationResponded {
                        invoice_id,
                        approved: true,
                        errored: false,
                        reason: None,
                    },
                    Err(e) => CustomerVerificationResponded {
                        invoice_id,
                        approved: false,
                        errored: true,
                        reason: Some(format!("failed to provision customer: {e}")),
                    },
                }
            }
            Err(e) => CustomerVerificationResponded {
                invoice_id,
                approved: false,
                errored: true,
                reason: Some(format!("failed to look up customer: {e}")),
            },
        };

        self.publish(subjects::CUSTOMER_VERIFICATION_RESPONDED, response, correlation_id)
            .await
    }

    pub async fn handle_silence_timeout(&self, customer_id: &str) -> Result<(), AccountsError> {
        let expected = self.expected_services.clone();
        let (customer, effects) = self
            .transition(customer_id, |customer, now| {
                Ok(deletion::on_silence_timeout(customer, &expected, now))
            })
            .await?;

        self.apply_effects(&customer, effects, None).await
    }

    /// Re-arm silence timers for every customer still `PENDING_DELETION`
    /// after a restart, mirroring `BillingService::recover_payment_timers`.
    pub async fn recover_silence_timers(&self) -> Result<(), AccountsError> {
        let overdue = self.store.list_pending_deletions_past_timeout(Utc::now()).await?;
        for customer in &overdue {
            warn!(customer_id = %customer.customer_id, "silence timeout already overdue at startup, firing immediately");
            self.timers.schedule_now(customer.customer_id.clone());
        }
        Ok(())
    }

    async fn rollback(&self, customer_id: &str) -> Result<(), AccountsError> {
        let locks = self.locks.clone();
        let store = self.store.clone();
        let id = customer_id.to_string();

        self.timers.cancel(customer_id);
        locks
            .with_lock(&id, || async move {
                let Some(current) = store.get(&id).await? else {
                    return Ok(());
                };
                let expected_status = current.status;
                let expected_completed = current.deletion_completed;
                let mut rolled_back = current;
                deletion::rollback_request(&mut rolled_back, Utc::now());
                store.replace(expected_status, expected_completed, &rolled_back).await?;
                Ok(())
            })
            .await
    }

    async fn transition<F>(&self, customer_id: &str, f: F) -> Result<(Customer, Vec<DeletionEffect>), AccountsError>
    where
        F: Fn(&mut Customer, chrono::DateTime<Utc>) -> Result<Vec<DeletionEffect>, AccountsError>,
    {
        let locks = self.locks.clone();
        let store = self.store.clone();
        let id = customer_id.to_string();

        locks
            .with_lock(&id, || async move {
                let mut attempts = 0;
                loop {
                    let current = store.get(&id).await?.ok_or(AccountsError::NotFound)?;
                    let expected_status = current.status;
                    let expected_completed = current.deletion_completed;
                    let responses_before = current.deletion_responses.len();
                    let mut customer = current;
                    let effects = f(&mut customer, Utc::now())?;

                    if effects.is_empty()
                        && customer.status == expected_status
                        && customer.deletion_completed == expected_completed
                        && customer.deletion_responses.len() == responses_before
                    {
                        return Ok((customer, effects));
                    }
                    if store.replace(expected_status, expected_completed, &customer).await? {
                        return Ok((customer, effects));
                    }
                    attempts += 1;
                    if attempts >= MAX_CAS_ATTEMPTS {
                        return Err(AccountsError::InvalidRequest(
                            "too much contention updating customer".to_string(),
                        ));
                    }
                }
            })
            .await
    }

    async fn apply_effects(
        &self,
        customer: &Customer,
        effects: Vec<DeletionEffect>,
        correlation_id: Option<String>,
    ) -> Result<(), AccountsError> {
        for effect in effects {
            match effect {
                DeletionEffect::PublishDeletionRequest => {
                    self.publish(
                        subjects::CUSTOMER_DELETION_REQUESTED,
                        CustomerDeletionRequested {
                            customer_id: customer.customer_id.clone(),
                            expected_services: self.expected_services.clone(),
                        },
                        correlation_id.clone(),
                    )
                    .await?;
                }
                DeletionEffect::PublishDeletionResult { decision, blocked_by } => {
                    info!(customer_id = %customer.customer_id, ?decision, "customer deletion decision reached");
                    self.publish(
                        subjects::CUSTOMER_DELETION_RESULT,
                        CustomerDeletionResult {
                            customer_id: customer.customer_id.clone(),
                            outcome: match decision {
                                deletion::Decision::Commit => DeletionOutcome::Commit,
                                deletion::Decision::Cancel => DeletionOutcome::Cancel,
                            },
                            blocked_by,
                        },
                        correlation_id.clone(),
                    )
                    .await?;
                }
                DeletionEffect::PublishDeletionCompleted { method } => {
                    self.publish(
                        subjects::CUSTOMER_DELETION_COMPLETED,
                        CustomerDeletionCompleted {
                            customer_id: customer.customer_id.clone(),
                            method,
                        },
                        correlation_id.clone(),
                    )
                    .await?;
                }
                DeletionEffect::StartSilenceTimeout => {
                    self.timers.schedule(
                        customer.customer_id.clone(),
                        customer
                            .deletion_timeout_at
                            .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(self.silence_timeout_seconds)),
                    );
                }
                DeletionEffect::CancelSilenceTimeout => {
                    self.timers.cancel(&customer.customer_id);
                }
            }
        }
        Ok(())
    }

    async fn publish<T: serde::Serialize>(
        &self,
        subject: &str,
        payload: T,
        correlation_id: Option<String>,
    ) -> Result<(), AccountsError> {
        let envelope = envelope::build_envelope(TENANT_ID, correlation_id, None, payload);
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| AccountsError::Bus(event_bus::BusError::SerializationError(e.to_string())))?;
        self.outbox.enqueue(subject, bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::outbox::DirectOutbox;
    use crate::store::InMemoryCustomerStore;
    use crate::timers::TimerWheel;
    use event_bus::{EventBus, InMemoryBus};
    use futures::StreamExt;

    async fn test_service() -> (Arc<AccountsService>, Arc<InMemoryCustomerStore>, Arc<InMemoryBus>) {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryCustomerStore::new());
        let (timers, _fired) = TimerWheel::spawn();
        let service = Arc::new(AccountsService::new(
            store.clone(),
            Arc::new(DirectOutbox::new(bus.clone())),
            Arc::new(timers),
            vec!["billing".to_string(), "inventory".to_string(), "payment".to_string()],
            60,
        ));
        (service, store, bus)
    }

    #[tokio::test]
    async fn test_verification_of_existing_customer_approves_without_side_effects() {
        let (service, store, bus) = test_service().await;
        store
            .insert(&Customer::new(
                "cust-1".to_string(),
                "a@example.com".to_string(),
                "Ada".to_string(),
                "Lovelace".to_string(),
            ))
            .await
            .unwrap();

        let mut responses = bus.subscribe(subjects::CUSTOMER_VERIFICATION_RESPONDED).await.unwrap();
        let invoice_id = Uuid::new_v4();
        service
            .handle_customer_verification(invoice_id, "cust-1", None, None)
            .await
            .unwrap();

        let msg = responses.next().await.unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(raw["payload"]["approved"], true);
        assert_eq!(raw["payload"]["errored"], false);
    }

    #[tokio::test]
    async fn test_verification_of_unknown_customer_provisions_and_approves() {
        let (service, store, bus) = test_service().await;
        let mut responses = bus.subscribe(subjects::CUSTOMER_VERIFICATION_RESPONDED).await.unwrap();
        let invoice_id = Uuid::new_v4();

        service
            .handle_customer_verification(
                invoice_id,
                "cust-new",
                Some("cust-new@real-domain.example".to_string()),
                None,
            )
            .await
            .unwrap();

        let provisioned = store.get("cust-new").await.unwrap();
        assert!(provisioned.is_some(), "an unknown customer_id must be provisioned, not rejected");
        assert_eq!(
            provisioned.unwrap().email,
            "cust-new@real-domain.example",
            "the real email carried on the request must be used, not the generated placeholder"
        );

        let msg = responses.next().await.unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(raw["payload"]["approved"], true);
        assert_eq!(raw["payload"]["errored"], false);
    }

    #[tokio::test]
    async fn test_verification_without_an_email_falls_back_to_a_generated_address() {
        let (service, store, _bus) = test_service().await;
        let invoice_id = Uuid::new_v4();

        service
            .handle_customer_verification(invoice_id, "cust-no-email", None, None)
            .await
            .unwrap();

        let provisioned = store.get("cust-no-email").await.unwrap().unwrap();
        assert_eq!(provisioned.email, "cust-no-email@generated.invalid");
    }

    /// A vote that doesn't yet complete the quorum (no effects, status and
    /// `deletion_completed` both unchanged) still mutates
    /// `deletion_responses` and must be persisted — otherwise the next
    /// vote would evaluate against an empty response set and consensus
    /// could never be reached.
    #[tokio::test]
    async fn test_partial_vote_is_persisted_even_with_no_finalizing_effects() {
        let (service, store, _bus) = test_service().await;
        store
            .insert(&Customer::new(
                "cust-1".to_string(),
                "a@example.com".to_string(),
                "Ada".to_string(),
                "Lovelace".to_string(),
            ))
            .await
            .unwrap();

        service.request_deletion("cust-1").await.unwrap();
        service
            .handle_deletion_response("cust-1", "inventory", true, None, None)
            .await
            .unwrap();

        let reloaded = store.get("cust-1").await.unwrap().unwrap();
        assert_eq!(
            reloaded.deletion_responses.len(),
            1,
            "the first vote must be persisted even though it alone doesn't finalize the decision"
        );
        assert_eq!(reloaded.status, CustomerStatus::PendingDeletion);

        service
            .handle_deletion_response("cust-1", "billing", true, None, None)
            .await
            .unwrap();
        service
            .handle_deletion_response("cust-1", "payment", true, None, None)
            .await
            .unwrap();

        let final_state = store.get("cust-1").await.unwrap().unwrap();
        assert_eq!(final_state.status, CustomerStatus::Deleted);
    }
}
