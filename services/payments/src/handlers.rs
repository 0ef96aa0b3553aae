//! Ties payment authorization and the deletion-vote validator to storage
//! and the outbox.
//!
//! There is no external gateway in this environment: authorization is
//! decided locally and immediately, but it is still modeled as a
//! `PENDING -> {SUCCEEDED, FAILED}` transition on a persisted row so the
//! deletion validator has something to check for "mid-authorization".

use std::sync::Arc;

use chrono::Utc;
use entity_store::EntityLocks;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PaymentsError;
use crate::events::envelope::{
    self, subjects, CustomerDeletionResponded, DeletionVote, PaymentAuthorizationFailed,
    PaymentAuthorizationSucceeded,
};
use crate::events::outbox::Outbox;
use crate::models::{Payment, PaymentStatus};
use crate::store::PaymentStore;

const MAX_CAS_ATTEMPTS: u32 = 5;

pub struct PaymentsService {
    pub store: Arc<dyn PaymentStore>,
    pub outbox: Arc<dyn Outbox>,
    pub locks: Arc<EntityLocks<Uuid>>,
}

impl PaymentsService {
    pub fn new(store: Arc<dyn PaymentStore>, outbox: Arc<dyn Outbox>) -> Self {
        Self {
            store,
            outbox,
            locks: Arc::new(EntityLocks::new()),
        }
    }

    pub async fn handle_authorization_request(
        &self,
        invoice_id: Uuid,
        tenant_id: &str,
        amount: Decimal,
        customer_id: &str,
        correlation_id: Option<String>,
        causation_id: Option<String>,
    ) -> Result<(), PaymentsError> {
        let mut payment = Payment::new(invoice_id, customer_id.to_string(), amount);
        self.store.insert(&payment).await?;

        let outcome = self.authorize(amount);

        let locks = self.locks.clone();
        let store = self.store.clone();
        let payment_id = payment.payment_id;
        let failure_reason = match &outcome {
            Ok(()) => None,
            Err(reason) => Some(reason.clone()),
        };

        locks
            .with_lock(&payment_id, || async move {
                let mut attempts = 0;
                loop {
                    let Some(current) = store.get(payment_id).await? else {
                        return Err(PaymentsError::NotFound);
                    };
                    let expected_status = current.status;
                    let mut updated = current;
                    updated.status = if failure_reason.is_none() {
                        PaymentStatus::Succeeded
                    } else {
                        PaymentStatus::Failed
                    };
                    updated.failure_reason = failure_reason.clone();
                    updated.updated_at = Utc::now();

                    if store.replace(expected_status, &updated).await? {
                        return Ok(());
                    }
                    attempts += 1;
                    if attempts >= MAX_CAS_ATTEMPTS {
                        return Err(PaymentsError::InvalidRequest(
                            "too much contention updating payment".to_string(),
                        ));
                    }
                }
            })
            .await?;

        match outcome {
            Ok(()) => {
                info!(invoice_id = %invoice_id, payment_id = %payment.payment_id, "payment authorized");
                self.publish(
                    subjects::PAYMENT_AUTHORIZATION_SUCCEEDED,
                    tenant_id,
                    PaymentAuthorizationSucceeded {
                        invoice_id,
                        payment_id: payment.payment_id.to_string(),
                    },
                    correlation_id,
                    causation_id,
                )
                .await
            }
            Err(reason) => {
                warn!(invoice_id = %invoice_id, %reason, "payment authorization declined");
                self.publish(
                    subjects::PAYMENT_AUTHORIZATION_FAILED,
                    tenant_id,
                    PaymentAuthorizationFailed { invoice_id, reason },
                    correlation_id,
                    causation_id,
                )
                .await
            }
        }
        .map(|_| {
            payment.status = if payment.failure_reason.is_none() {
                PaymentStatus::Succeeded
            } else {
                PaymentStatus::Failed
            };
        })
    }

    /// No real gateway is wired up: the only declinable precondition is a
    /// non-positive amount. Everything else authorizes.
    fn authorize(&self, amount: Decimal) -> Result<(), String> {
        if amount <= Decimal::ZERO {
            Err("declined: non-positive amount".to_string())
        } else {
            Ok(())
        }
    }

    /// Payments vetoes a deletion only while it still has a payment
    /// in flight for that customer.
    pub async fn evaluate_deletion_vote(
        &self,
        customer_id: &str,
    ) -> Result<(DeletionVote, Option<String>), PaymentsError> {
        let pending = self.store.list_pending_for_customer(customer_id).await?;
        if pending.is_empty() {
            Ok((DeletionVote::Approve, None))
        } else {
            Ok((
                DeletionVote::Veto,
                Some(format!("customer has {} payment(s) in flight", pending.len())),
            ))
        }
    }

    pub async fn publish_deletion_vote(
        &self,
        customer_id: &str,
        correlation_id: Option<String>,
        causation_id: Option<String>,
    ) -> Result<(), PaymentsError> {
        let (vote, reason) = self.evaluate_deletion_vote(customer_id).await?;
        self.publish(
            subjects::CUSTOMER_DELETION_RESPONDED,
            "platform",
            CustomerDeletionResponded {
                customer_id: customer_id.to_string(),
                service: envelope::SOURCE_MODULE.to_string(),
                vote,
                reason,
            },
            correlation_id,
            causation_id,
        )
        .await
    }

    async fn publish<T: serde::Serialize>(
        &self,
        subject: &str,
        tenant_id: &str,
        payload: T,
        correlation_id: Option<String>,
        causation_id: Option<String>,
    ) -> Result<(), PaymentsError> {
        let envelope = envelope::build_envelope(tenant_id, correlation_id, causation_id, payload);
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| PaymentsError::Bus(event_bus::BusError::SerializationError(e.to_string())))?;
        self.outbox.enqueue(subject, bytes).await?;
        Ok(())
    }
}
