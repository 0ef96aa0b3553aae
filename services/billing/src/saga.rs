//! The invoice saga's finite state machine.
//!
//! Every function here is a pure transition: given the invoice's current
//! state and an incoming fact, it mutates the invoice and returns the list
//! of [`SagaEffect`]s the caller must carry out (publish an event, start or
//! cancel the payment timer). Keeping the decision logic free of I/O is
//! what makes it possible to unit test every branch — including the late-
//! event and double-delivery cases — without a bus or a database.
//!
//! State machine:
//!
//! ```text
//! PENDING --(create)--> PROCESSING --(inventory available)--> PAYMENT_PROCESSING
//!   PAYMENT_PROCESSING --(payment succeeded)--> COMPLETED
//!   PAYMENT_PROCESSING --(payment failed)-----> FAILED        (+ compensate inventory)
//!   PAYMENT_PROCESSING --(timeout)------------> CANCELLED     (+ compensate inventory)
//!   PROCESSING --(inventory rejected)---------> FAILED
//!   any non-terminal --(customer check errored)--> FAILED     (+ compensate inventory if reserved,
//!                                                               + cancel payment timeout if in flight)
//! ```
//!
//! Inventory availability is the sole gate on `PROCESSING -> PAYMENT_PROCESSING`
//! (spec.md §4.3, §4.4): customer verification runs concurrently but only
//! ever narrates `customer_status`, never blocks or advances the saga,
//! except that an *errored* check unconditionally fails the invoice from
//! whatever non-terminal state it is in — including after payment
//! authorization has already been requested.
//!
//! Once an invoice reaches a terminal status every further transition is a
//! no-op: handlers call these functions unconditionally and rely on them to
//! absorb duplicate or late-arriving events rather than checking status
//! themselves. The ignored event is still recorded, via [`Invoice::note`],
//! in the per-stage narrative rather than silently dropped.

use chrono::{Duration as ChronoDuration, Utc};

use crate::models::{Invoice, InvoiceStatus, SubStatus};

/// Side effects a transition wants carried out. The caller (a consumer task
/// or HTTP handler) is responsible for actually publishing/scheduling them;
/// the saga itself never touches the bus or a timer.
#[derive(Debug, Clone, PartialEq)]
pub enum SagaEffect {
    PublishInventoryCheck,
    PublishCustomerCheck,
    PublishPaymentRequest,
    PublishCompensateInventory { reason: String },
    PublishInvoiceCompleted,
    PublishInvoiceFailed { reason: String },
    PublishInvoiceCancelled { reason: String },
    StartPaymentTimeout,
    CancelPaymentTimeout,
}

/// spec.md §5 default; overridden per-deployment by `Config::payment_timeout_seconds`.
pub const PAYMENT_TIMEOUT_SECONDS: i64 = 60;

/// `PENDING -> PROCESSING`. Kicks off inventory reservation and customer
/// verification as concurrent, independent checks.
pub fn on_create(invoice: &mut Invoice) -> Vec<SagaEffect> {
    invoice.status = InvoiceStatus::Processing;
    invoice.updated_at = Utc::now();
    vec![
        SagaEffect::PublishInventoryCheck,
        SagaEffect::PublishCustomerCheck,
    ]
}

fn fail(invoice: &mut Invoice, reason: impl Into<String>) -> Vec<SagaEffect> {
    let reason = reason.into();
    let was_inventory_reserved = invoice.inventory_status == SubStatus::Approved;
    let was_payment_in_flight = invoice.status == InvoiceStatus::PaymentProcessing;
    invoice.status = InvoiceStatus::Failed;
    invoice.failure_reason = Some(reason.clone());
    invoice.updated_at = Utc::now();

    let mut effects = Vec::new();
    if was_payment_in_flight {
        effects.push(SagaEffect::CancelPaymentTimeout);
    }
    effects.push(SagaEffect::PublishInvoiceFailed { reason: reason.clone() });
    if was_inventory_reserved {
        effects.push(SagaEffect::PublishCompensateInventory { reason });
    }
    effects
}

/// `PROCESSING -> PAYMENT_PROCESSING`. Inventory availability alone gates
/// this transition (spec.md §4.3 rule, §4.4 `OnInventoryResponse`); customer
/// verification never blocks it.
pub fn on_inventory_response(
    invoice: &mut Invoice,
    approved: bool,
    reason: Option<String>,
    payment_timeout_seconds: i64,
) -> Vec<SagaEffect> {
    if invoice.status.is_terminal() {
        invoice.note(format!(
            "late inventory response (available={approved}) ignored: invoice already {:?}",
            invoice.status
        ));
        return Vec::new();
    }
    if invoice.status != InvoiceStatus::Processing {
        invoice.note(format!(
            "duplicate inventory response (available={approved}) ignored: invoice already in {:?}",
            invoice.status
        ));
        return Vec::new();
    }

    if approved {
        invoice.inventory_status = SubStatus::Approved;
        invoice.status = InvoiceStatus::PaymentProcessing;
        invoice.payment_timeout_at =
            Some(Utc::now() + ChronoDuration::seconds(payment_timeout_seconds));
        invoice.updated_at = Utc::now();
        vec![
            SagaEffect::PublishPaymentRequest,
            SagaEffect::StartPaymentTimeout,
        ]
    } else {
        invoice.inventory_status = SubStatus::Rejected;
        fail(invoice, reason.unwrap_or_else(|| "inventory unavailable".to_string()))
    }
}

/// Customer verification results in one of three facts: the customer
/// exists (approved), the customer was just created by another request
/// (also approved, informational), or the check itself errored. An error
/// always fails the invoice outright — from whatever non-terminal state it
/// finds it in, since this check runs concurrently with (and never gates)
/// inventory reservation and payment authorization. A non-error rejection
/// only narrates `customer_status`; it is never retried inline and never
/// fails the invoice on its own (spec.md §4.4, §9 open question: resolved
/// in favor of "only an error fails unconditionally").
pub fn on_customer_response(
    invoice: &mut Invoice,
    approved: bool,
    errored: bool,
    reason: Option<String>,
) -> Vec<SagaEffect> {
    if invoice.status.is_terminal() {
        invoice.note(format!(
            "late customer response (approved={approved}, errored={errored}) ignored: invoice already {:?}",
            invoice.status
        ));
        return Vec::new();
    }

    if errored {
        return fail(invoice, reason.unwrap_or_else(|| "customer verification errored".to_string()));
    }

    invoice.customer_status = if approved { SubStatus::Approved } else { SubStatus::Rejected };
    invoice.updated_at = Utc::now();
    Vec::new()
}

pub fn on_payment_completed(invoice: &mut Invoice) -> Vec<SagaEffect> {
    if invoice.status != InvoiceStatus::PaymentProcessing {
        invoice.note(format!(
            "late payment-completed event ignored: invoice already {:?}",
            invoice.status
        ));
        return Vec::new();
    }
    invoice.payment_status = SubStatus::Approved;
    invoice.status = InvoiceStatus::Completed;
    invoice.updated_at = Utc::now();
    vec![
        SagaEffect::CancelPaymentTimeout,
        SagaEffect::PublishInvoiceCompleted,
    ]
}

pub fn on_payment_failed(invoice: &mut Invoice, reason: String) -> Vec<SagaEffect> {
    if invoice.status != InvoiceStatus::PaymentProcessing {
        invoice.note(format!(
            "late payment-failed event ({reason}) ignored: invoice already {:?}",
            invoice.status
        ));
        return Vec::new();
    }
    invoice.payment_status = SubStatus::Rejected;
    // `fail` detects PAYMENT_PROCESSING itself and emits CancelPaymentTimeout.
    fail(invoice, reason)
}

/// Fired by the timer wheel when a payment request has been outstanding
/// past [`PAYMENT_TIMEOUT_SECONDS`] with no completion or failure. Distinct
/// from [`on_payment_failed`] because the saga ends CANCELLED, not FAILED:
/// the payment gateway never told us it failed, we simply gave up waiting.
pub fn on_payment_timeout(invoice: &mut Invoice) -> Vec<SagaEffect> {
    if invoice.status != InvoiceStatus::PaymentProcessing {
        // The timer wheel re-checks status before acting (spec.md §5
        // cancellation rule); this branch only fires if the invoice moved
        // on between the check and here, or the timer fired twice.
        invoice.note(format!(
            "payment timeout fired but invoice already {:?}; ignored",
            invoice.status
        ));
        return Vec::new();
    }
    let was_inventory_reserved = invoice.inventory_status == SubStatus::Approved;
    invoice.status = InvoiceStatus::Cancelled;
    invoice.failure_reason = Some("payment authorization timed out".to_string());
    invoice.updated_at = Utc::now();

    let mut effects = vec![SagaEffect::PublishInvoiceCancelled {
        reason: "payment authorization timed out".to_string(),
    }];
    if was_inventory_reserved {
        effects.push(SagaEffect::PublishCompensateInventory {
            reason: "payment authorization timed out".to_string(),
        });
    }
    effects
}
