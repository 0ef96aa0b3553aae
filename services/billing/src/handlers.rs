//! Ties the saga FSM to storage, the outbox and the timer wheel.
//!
//! Every entry point below — whether triggered by an HTTP request or an
//! inbound event — follows the same shape: lock the invoice, load it,
//! apply one [`crate::saga`] transition, write the result back with an
//! optimistic predicate, then carry out whatever [`SagaEffect`]s came back.
//! Locking and the predicate together mean a duplicate delivery or a race
//! between two handlers for the same invoice can't double-publish.

use std::sync::Arc;

use chrono::Utc;
use entity_store::EntityLocks;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::BillingError;
use crate::events::envelope::{self, subjects, *};
use crate::events::outbox::Outbox;
use crate::models::{CreateInvoiceRequest, Invoice, InvoiceResponse, InvoiceStatus};
use crate::saga::{self, SagaEffect};
use crate::store::InvoiceStore;
use crate::timers::TimerWheel;

const MAX_CAS_ATTEMPTS: u32 = 5;

pub struct BillingService {
    pub store: Arc<dyn InvoiceStore>,
    pub outbox: Arc<dyn Outbox>,
    pub locks: Arc<EntityLocks<Uuid>>,
    pub timers: Arc<TimerWheel>,
    pub payment_timeout_seconds: i64,
}

impl BillingService {
    pub fn new(
        store: Arc<dyn InvoiceStore>,
        outbox: Arc<dyn Outbox>,
        timers: Arc<TimerWheel>,
    ) -> Self {
        Self::with_payment_timeout(store, outbox, timers, saga::PAYMENT_TIMEOUT_SECONDS)
    }

    pub fn with_payment_timeout(
        store: Arc<dyn InvoiceStore>,
        outbox: Arc<dyn Outbox>,
        timers: Arc<TimerWheel>,
        payment_timeout_seconds: i64,
    ) -> Self {
        Self {
            store,
            outbox,
            locks: Arc::new(EntityLocks::new()),
            timers,
            payment_timeout_seconds,
        }
    }

    pub async fn create_invoice(
        &self,
        req: CreateInvoiceRequest,
    ) -> Result<InvoiceResponse, BillingError> {
        if req.customer_id.trim().is_empty() {
            return Err(BillingError::InvalidRequest(
                "customer_id must not be empty".to_string(),
            ));
        }
        if req.customer_email.trim().is_empty() {
            return Err(BillingError::InvalidRequest(
                "customer_email must not be empty".to_string(),
            ));
        }
        if req.items.is_empty() || req.items.iter().any(|i| i.quantity < 1) {
            return Err(BillingError::InvalidRequest(
                "invoice must contain at least one line item with quantity >= 1".to_string(),
            ));
        }

        let mut invoice = Invoice::new(req.tenant_id, req.customer_id, req.customer_email, req.items);
        let effects = saga::on_create(&mut invoice);
        self.store.insert(&invoice).await?;

        let correlation_id = invoice.invoice_id.to_string();
        if let Err(e) = self
            .apply_effects(&invoice, effects, Some(correlation_id), None)
            .await
        {
            // spec.md §4.4: "On publish failure for either [check], transitions
            // to FAILED with a descriptive note." The invoice already exists
            // (PROCESSING), so unlike deletion's initiation rollback this is a
            // forward transition, not an undo — best-effort since we're
            // already on the error path and must not mask the original cause.
            warn!(invoice_id = %invoice.invoice_id, error = %e, "fan-out publish failed, failing invoice");
            invoice.status = InvoiceStatus::Failed;
            invoice.failure_reason = Some(format!("fan-out publish failed: {e}"));
            invoice.updated_at = Utc::now();
            invoice.note(format!("creation fan-out publish failed: {e}"));
            if let Err(store_err) = self.store.replace(InvoiceStatus::Processing, &invoice).await {
                warn!(invoice_id = %invoice.invoice_id, error = %store_err, "failed to persist FAILED status after publish failure");
            }
            return Err(e);
        }

        Ok(InvoiceResponse::from(&invoice))
    }

    pub async fn get_invoice(&self, invoice_id: Uuid) -> Result<InvoiceResponse, BillingError> {
        let invoice = self
            .store
            .get(invoice_id)
            .await?
            .ok_or(BillingError::NotFound)?;
        Ok(InvoiceResponse::from(&invoice))
    }

    pub async fn handle_inventory_response(
        &self,
        invoice_id: Uuid,
        approved: bool,
        reason: Option<String>,
        correlation_id: Option<String>,
    ) -> Result<(), BillingError> {
        let payment_timeout_seconds = self.payment_timeout_seconds;
        self.transition(invoice_id, correlation_id, |invoice| {
            saga::on_inventory_response(invoice, approved, reason.clone(), payment_timeout_seconds)
        })
        .await
    }

    pub async fn handle_customer_response(
        &self,
        invoice_id: Uuid,
        approved: bool,
        errored: bool,
        reason: Option<String>,
        correlation_id: Option<String>,
    ) -> Result<(), BillingError> {
        self.transition(invoice_id, correlation_id, |invoice| {
            saga::on_customer_response(invoice, approved, errored, reason.clone())
        })
        .await
    }

    pub async fn handle_payment_completed(
        &self,
        invoice_id: Uuid,
        correlation_id: Option<String>,
    ) -> Result<(), BillingError> {
        self.transition(invoice_id, correlation_id, |invoice| {
            saga::on_payment_completed(invoice)
        })
        .await
    }

    pub async fn handle_payment_failed(
        &self,
        invoice_id: Uuid,
        reason: String,
        correlation_id: Option<String>,
    ) -> Result<(), BillingError> {
        self.transition(invoice_id, correlation_id, |invoice| {
            saga::on_payment_failed(invoice, reason.clone())
        })
        .await
    }

    /// Records inventory's compensation confirmation as a narrative note.
    /// The invoice is already terminal by the time compensation runs
    /// (spec.md §4.7), so this never changes `status` — it just appends to
    /// the note trail, the same way a late saga event would.
    pub async fn handle_compensation_confirmed(
        &self,
        invoice_id: Uuid,
        successful: bool,
        error: Option<String>,
    ) -> Result<(), BillingError> {
        self.transition(invoice_id, None, move |invoice| {
            invoice.note(if successful {
                "inventory compensation confirmed".to_string()
            } else {
                format!(
                    "inventory compensation failed: {}",
                    error.clone().unwrap_or_else(|| "unknown error".to_string())
                )
            });
            Vec::new()
        })
        .await
    }

    pub async fn handle_payment_timeout(&self, invoice_id: Uuid) -> Result<(), BillingError> {
        self.transition(invoice_id, None, |invoice| saga::on_payment_timeout(invoice))
            .await
    }

    /// Re-arm payment timers for every invoice still awaiting payment after
    /// a restart. Without this, an instance that crashed mid-`PAYMENT_PROCESSING`
    /// would leave the invoice stuck forever since the original in-memory
    /// timer died with the process.
    pub async fn recover_payment_timers(&self) -> Result<(), BillingError> {
        let overdue = self.store.list_payment_timeouts_due(Utc::now()).await?;
        for invoice in &overdue {
            warn!(invoice_id = %invoice.invoice_id, "payment timeout already overdue at startup, firing immediately");
            self.timers.schedule_now(invoice.invoice_id);
        }
        Ok(())
    }

    async fn transition<F>(
        &self,
        invoice_id: Uuid,
        correlation_id: Option<String>,
        f: F,
    ) -> Result<(), BillingError>
    where
        F: Fn(&mut Invoice) -> Vec<SagaEffect>,
    {
        let locks = self.locks.clone();
        let store = self.store.clone();

        let (invoice, effects) = locks
            .with_lock(&invoice_id, || async move {
                let mut attempts = 0;
                loop {
                    let current = store.get(invoice_id).await?;
                    let Some(mut invoice) = current else {
                        return Err(BillingError::NotFound);
                    };
                    let expected_status = invoice.status;
                    let notes_before = invoice.notes.len();
                    let effects = f(&mut invoice);
                    if effects.is_empty()
                        && invoice.status == expected_status
                        && invoice.notes.len() == notes_before
                    {
                        return Ok((invoice, effects));
                    }
                    if store.replace(expected_status, &invoice).await? {
                        return Ok((invoice, effects));
                    }
                    attempts += 1;
                    if attempts >= MAX_CAS_ATTEMPTS {
                        return Err(BillingError::InvalidRequest(
                            "too much contention updating invoice".to_string(),
                        ));
                    }
                }
            })
            .await?;

        self.apply_effects(&invoice, effects, correlation_id, Some(invoice.invoice_id.to_string()))
            .await
    }

    async fn apply_effects(
        &self,
        invoice: &Invoice,
        effects: Vec<SagaEffect>,
        correlation_id: Option<String>,
        causation_id: Option<String>,
    ) -> Result<(), BillingError> {
        for effect in effects {
            match effect {
                SagaEffect::PublishInventoryCheck => {
                    self.publish(
                        subjects::INVENTORY_RESERVATION_REQUESTED,
                        invoice,
                        InventoryReservationRequested {
                            invoice_id: invoice.invoice_id,
                            items: invoice.items.clone(),
                        },
                        correlation_id.clone(),
                        causation_id.clone(),
                    )
                    .await?;
                }
                SagaEffect::PublishCustomerCheck => {
                    self.publish(
                        subjects::CUSTOMER_VERIFICATION_REQUESTED,
                        invoice,
                        CustomerVerificationRequested {
                            invoice_id: invoice.invoice_id,
                            customer_id: invoice.customer_id.clone(),
                            customer_email: invoice.customer_email.clone(),
                        },
                        correlation_id.clone(),
                        causation_id.clone(),
                    )
                    .await?;
                }
                SagaEffect::PublishPaymentRequest => {
                    self.publish(
                        subjects::PAYMENT_AUTHORIZATION_REQUESTED,
                        invoice,
                        PaymentAuthorizationRequested {
                            invoice_id: invoice.invoice_id,
                            amount: invoice.total_amount,
                            customer_id: invoice.customer_id.clone(),
                        },
                        correlation_id.clone(),
                        causation_id.clone(),
                    )
                    .await?;
                }
                SagaEffect::PublishCompensateInventory { reason } => {
                    self.publish(
                        subjects::INVENTORY_COMPENSATION_REQUESTED,
                        invoice,
                        InventoryCompensationRequested {
                            invoice_id: invoice.invoice_id,
                            items: invoice.items.clone(),
                            reason,
                            compensation_type: "restore_inventory".to_string(),
                            triggered_by: "billing".to_string(),
                        },
                        correlation_id.clone(),
                        causation_id.clone(),
                    )
                    .await?;
                }
                SagaEffect::PublishInvoiceCompleted => {
                    self.publish_terminal(invoice, InvoiceStatus::Completed, None, &correlation_id, &causation_id)
                        .await?;
                }
                SagaEffect::PublishInvoiceFailed { reason } => {
                    self.publish_terminal(
                        invoice,
                        InvoiceStatus::Failed,
                        Some(reason),
                        &correlation_id,
                        &causation_id,
                    )
                    .await?;
                }
                SagaEffect::PublishInvoiceCancelled { reason } => {
                    self.publish_terminal(
                        invoice,
                        InvoiceStatus::Cancelled,
                        Some(reason),
                        &correlation_id,
                        &causation_id,
                    )
                    .await?;
                }
                SagaEffect::StartPaymentTimeout => {
                    self.timers.schedule(
                        invoice.invoice_id,
                        invoice
                            .payment_timeout_at
                            .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(self.payment_timeout_seconds)),
                    );
                }
                SagaEffect::CancelPaymentTimeout => {
                    self.timers.cancel(invoice.invoice_id);
                }
            }
        }
        Ok(())
    }

    async fn publish_terminal(
        &self,
        invoice: &Invoice,
        status: InvoiceStatus,
        reason: Option<String>,
        correlation_id: &Option<String>,
        causation_id: &Option<String>,
    ) -> Result<(), BillingError> {
        let subject = match status {
            InvoiceStatus::Completed => subjects::INVOICE_COMPLETED,
            InvoiceStatus::Failed => subjects::INVOICE_FAILED,
            InvoiceStatus::Cancelled => subjects::INVOICE_CANCELLED,
            _ => unreachable!("publish_terminal only called for terminal statuses"),
        };
        info!(invoice_id = %invoice.invoice_id, %status, "invoice reached terminal status");
        self.publish(
            subject,
            invoice,
            InvoiceTerminalEvent {
                invoice_id: invoice.invoice_id,
                status,
                reason,
            },
            correlation_id.clone(),
            causation_id.clone(),
        )
        .await
    }

    async fn publish<T: serde::Serialize>(
        &self,
        subject: &str,
        invoice: &Invoice,
        payload: T,
        correlation_id: Option<String>,
        causation_id: Option<String>,
    ) -> Result<(), BillingError> {
        let envelope = envelope::build_envelope(&invoice.tenant_id, correlation_id, causation_id, payload);
        let bytes = serde_json::to_vec(&envelope).map_err(|e| {
            BillingError::Bus(event_bus::BusError::SerializationError(e.to_string()))
        })?;
        self.outbox
            .enqueue(subject, bytes)
            .await
            .map_err(BillingError::from)?;
        Ok(())
    }

    /// Billing's vote in the distributed customer-deletion protocol: any
    /// non-terminal invoice for this customer is grounds to veto.
    pub async fn evaluate_deletion_vote(
        &self,
        customer_id: &str,
    ) -> Result<(DeletionVote, Option<String>), BillingError> {
        let active = self.store.list_active_for_customer(customer_id).await?;
        if active.is_empty() {
            Ok((DeletionVote::Approve, None))
        } else {
            Ok((
                DeletionVote::Veto,
                Some(format!(
                    "customer has {} invoice(s) still in flight",
                    active.len()
                )),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::outbox::DirectOutbox;
    use crate::models::{CreateInvoiceRequest, LineItem};
    use crate::store::InMemoryInvoiceStore;
    use event_bus::InMemoryBus;
    use rust_decimal_macros::dec;

    fn test_service() -> Arc<BillingService> {
        let bus = Arc::new(InMemoryBus::new());
        let (timers, _fired) = TimerWheel::spawn();
        Arc::new(BillingService::new(
            Arc::new(InMemoryInvoiceStore::new()),
            Arc::new(DirectOutbox::new(bus)),
            Arc::new(timers),
        ))
    }

    async fn create_sample(service: &BillingService) -> Uuid {
        let response = service
            .create_invoice(CreateInvoiceRequest {
                tenant_id: "tenant-a".to_string(),
                customer_id: "cust-1".to_string(),
                customer_email: "cust-1@example.com".to_string(),
                items: vec![LineItem {
                    product_id: "sku-1".to_string(),
                    quantity: 2,
                    unit_price: dec!(10.00),
                }],
            })
            .await
            .unwrap();
        response.invoice_id
    }

    /// A no-op transition (a late or duplicate event against a terminal
    /// invoice) must still persist the note it appends — the early-return
    /// optimization in `transition` must not discard it.
    #[tokio::test]
    async fn test_late_event_note_is_persisted_even_with_no_effects() {
        let service = test_service();
        let invoice_id = create_sample(&service).await;

        service
            .handle_inventory_response(invoice_id, false, Some("out of stock".to_string()), None)
            .await
            .unwrap();
        let failed = service.get_invoice(invoice_id).await.unwrap();
        assert_eq!(failed.status, InvoiceStatus::Failed);

        // Duplicate delivery of the same inventory response after the
        // invoice is already terminal: no effects, status unchanged, but a
        // note must still land in storage.
        service
            .handle_inventory_response(invoice_id, false, Some("out of stock".to_string()), None)
            .await
            .unwrap();

        let reloaded = service.get_invoice(invoice_id).await.unwrap();
        assert_eq!(
            reloaded.notes.len(),
            1,
            "the late/duplicate delivery's note must have been written back to the store"
        );
    }

    #[tokio::test]
    async fn test_compensation_confirmation_is_recorded_as_a_note_without_changing_status() {
        let service = test_service();
        let invoice_id = create_sample(&service).await;
        service
            .handle_inventory_response(invoice_id, true, None)
            .await
            .unwrap();
        service
            .handle_payment_failed(invoice_id, "card declined".to_string(), None)
            .await
            .unwrap();
        let failed = service.get_invoice(invoice_id).await.unwrap();
        assert_eq!(failed.status, InvoiceStatus::Failed);

        service
            .handle_compensation_confirmed(invoice_id, true, None)
            .await
            .unwrap();

        let reloaded = service.get_invoice(invoice_id).await.unwrap();
        assert_eq!(reloaded.status, InvoiceStatus::Failed);
        assert_eq!(reloaded.notes.len(), 1);
        assert!(reloaded.notes[0].contains("compensation confirmed"));
    }
}
