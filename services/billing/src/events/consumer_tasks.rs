//! Subscriptions billing holds on the bus.
//!
//! Every task follows the same shape as the platform's ar/payments
//! consumers: subscribe, open a tracing span carrying the correlation
//! fields, skip anything already recorded in the idempotency ledger, run
//! the handler under [`retry_with_backoff`], and dead-letter it if retries
//! are exhausted.

use std::sync::Arc;

use entity_store::{DeadLetterQueue, IdempotencyLedger, InMemoryDeadLetterQueue, InMemoryIdempotencyLedger};
use event_bus::consumer_retry::{retry_with_backoff, RetryConfig};
use event_bus::{extract_payload, EventBus};
use futures::StreamExt;
use serde_json::Value;
use tracing::{error, info_span, Instrument};
use uuid::Uuid;

use crate::events::envelope::{
    extract_correlation_fields, subjects, CustomerVerificationResponded,
    InventoryCompensationResponded, InventoryReservationResponded, PaymentAuthorizationFailed,
    PaymentAuthorizationSucceeded,
};
use crate::handlers::BillingService;

const PROCESSOR: &str = "billing";

pub fn spawn_all(
    bus: Arc<dyn EventBus>,
    service: Arc<BillingService>,
    ledger: Arc<dyn IdempotencyLedger>,
    dlq: Arc<dyn DeadLetterQueue>,
) {
    tokio::spawn(consume_inventory_responses(bus.clone(), service.clone(), ledger.clone(), dlq.clone()));
    tokio::spawn(consume_customer_responses(bus.clone(), service.clone(), ledger.clone(), dlq.clone()));
    tokio::spawn(consume_payment_succeeded(bus.clone(), service.clone(), ledger.clone(), dlq.clone()));
    tokio::spawn(consume_payment_failed(bus.clone(), service.clone(), ledger.clone(), dlq.clone()));
    tokio::spawn(consume_compensation_confirmations(bus.clone(), service.clone(), ledger.clone(), dlq.clone()));
    tokio::spawn(consume_deletion_requests(bus, service, ledger));
}

pub fn default_ledger() -> Arc<dyn IdempotencyLedger> {
    Arc::new(InMemoryIdempotencyLedger::new())
}

pub fn default_dlq() -> Arc<dyn DeadLetterQueue> {
    Arc::new(InMemoryDeadLetterQueue::new())
}

/// Records a retry-exhausted event in the dead-letter queue, keyed by the
/// envelope's own `event_id` when it parses as a UUID (it always should —
/// `build_envelope` stamps it) and a fresh one otherwise so the failure is
/// never silently dropped.
async fn dead_letter(
    dlq: &Arc<dyn DeadLetterQueue>,
    event_id: &str,
    subject: &str,
    envelope: &Value,
    error: &str,
) {
    let tenant_id = envelope.get("tenant_id").and_then(|v| v.as_str()).unwrap_or("unknown");
    let uuid = Uuid::parse_str(event_id).unwrap_or_else(|_| Uuid::new_v4());
    if let Err(e) = dlq
        .record_failure(uuid, subject, tenant_id, envelope, error, RetryConfig::default().max_attempts as i32)
        .await
    {
        error!(error = %e, event_id, subject, "failed to record dead-lettered event");
    }
}

async fn consume_inventory_responses(
    bus: Arc<dyn EventBus>,
    service: Arc<BillingService>,
    ledger: Arc<dyn IdempotencyLedger>,
    dlq: Arc<dyn DeadLetterQueue>,
) {
    let mut stream = match bus.subscribe(subjects::INVENTORY_RESERVATION_RESPONDED).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to subscribe to inventory responses");
            return;
        }
    };

    while let Some(msg) = stream.next().await {
        let Ok(raw): Result<Value, _> = serde_json::from_slice(&msg.payload) else {
            error!("inventory response payload was not valid JSON");
            continue;
        };
        let (correlation_id, source_module, event_id) = extract_correlation_fields(&raw);
        let span = info_span!("consume_inventory_response", ?event_id, tenant_id = ?raw.get("tenant_id").and_then(|v| v.as_str()), ?correlation_id, ?source_module);

        async {
            let Some(event_id) = event_id else { return };
            if already_processed(&ledger, &event_id).await {
                return;
            }
            let Some(payload) = extract_payload(&raw) else { return };
            let Ok(payload) = serde_json::from_value::<InventoryReservationResponded>(payload.clone()) else {
                error!("could not decode inventory response payload");
                return;
            };

            let result = retry_with_backoff(
                || async {
                    service
                        .handle_inventory_response(
                            payload.invoice_id,
                            payload.approved,
                            payload.reason.clone(),
                            correlation_id.clone(),
                        )
                        .await
                        .map_err(|e| e.to_string())
                },
                &RetryConfig::default(),
                "handle_inventory_response",
            )
            .await;

            match result {
                Ok(()) => mark_processed(&ledger, &event_id, "inventory.reservation.responded").await,
                Err(e) => {
                    error!(error = %e, invoice_id = %payload.invoice_id, "giving up on inventory response after retries");
                    dead_letter(&dlq, &event_id, subjects::INVENTORY_RESERVATION_RESPONDED, &raw, &e).await;
                }
            }
        }
        .instrument(span)
        .await;
    }
}

async fn consume_customer_responses(
    bus: Arc<dyn EventBus>,
    service: Arc<BillingService>,
    ledger: Arc<dyn IdempotencyLedger>,
    dlq: Arc<dyn DeadLetterQueue>,
) {
    let mut stream = match bus.subscribe(subjects::CUSTOMER_VERIFICATION_RESPONDED).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to subscribe to customer responses");
            return;
        }
    };

    while let Some(msg) = stream.next().await {
        let Ok(raw): Result<Value, _> = serde_json::from_slice(&msg.payload) else {
            continue;
        };
        let (correlation_id, _source_module, event_id) = extract_correlation_fields(&raw);
        let span = info_span!("consume_customer_response", ?event_id, ?correlation_id);

        async {
            let Some(event_id) = event_id else { return };
            if already_processed(&ledger, &event_id).await {
                return;
            }
            let Some(payload) = extract_payload(&raw) else { return };
            let Ok(payload) = serde_json::from_value::<CustomerVerificationResponded>(payload.clone()) else {
                error!("could not decode customer response payload");
                return;
            };

            let result = retry_with_backoff(
                || async {
                    service
                        .handle_customer_response(
                            payload.invoice_id,
                            payload.approved,
                            payload.errored,
                            payload.reason.clone(),
                            correlation_id.clone(),
                        )
                        .await
                        .map_err(|e| e.to_string())
                },
                &RetryConfig::default(),
                "handle_customer_response",
            )
            .await;

            match result {
                Ok(()) => mark_processed(&ledger, &event_id, "customer.verification.responded").await,
                Err(e) => {
                    error!(error = %e, invoice_id = %payload.invoice_id, "giving up on customer response after retries");
                    dead_letter(&dlq, &event_id, subjects::CUSTOMER_VERIFICATION_RESPONDED, &raw, &e).await;
                }
            }
        }
        .instrument(span)
        .await;
    }
}

async fn consume_payment_succeeded(
    bus: Arc<dyn EventBus>,
    service: Arc<BillingService>,
    ledger: Arc<dyn IdempotencyLedger>,
    dlq: Arc<dyn DeadLetterQueue>,
) {
    let mut stream = match bus.subscribe(subjects::PAYMENT_AUTHORIZATION_SUCCEEDED).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to subscribe to payment succeeded");
            return;
        }
    };

    while let Some(msg) = stream.next().await {
        let Ok(raw): Result<Value, _> = serde_json::from_slice(&msg.payload) else {
            continue;
        };
        let (correlation_id, _source_module, event_id) = extract_correlation_fields(&raw);
        let span = info_span!("consume_payment_succeeded", ?event_id, ?correlation_id);

        async {
            let Some(event_id) = event_id else { return };
            if already_processed(&ledger, &event_id).await {
                return;
            }
            let Some(payload) = extract_payload(&raw) else { return };
            let Ok(payload) = serde_json::from_value::<PaymentAuthorizationSucceeded>(payload.clone()) else {
                error!("could not decode payment succeeded payload");
                return;
            };

            let result = retry_with_backoff(
                || async {
                    service
                        .handle_payment_completed(payload.invoice_id, correlation_id.clone())
                        .await
                        .map_err(|e| e.to_string())
                },
                &RetryConfig::default(),
                "handle_payment_completed",
            )
            .await;

            match result {
                Ok(()) => mark_processed(&ledger, &event_id, "payment.authorization.succeeded").await,
                Err(e) => {
                    error!(error = %e, invoice_id = %payload.invoice_id, "giving up on payment succeeded after retries");
                    dead_letter(&dlq, &event_id, subjects::PAYMENT_AUTHORIZATION_SUCCEEDED, &raw, &e).await;
                }
            }
        }
        .instrument(span)
        .await;
    }
}

async fn consume_payment_failed(
    bus: Arc<dyn EventBus>,
    service: Arc<BillingService>,
    ledger: Arc<dyn IdempotencyLedger>,
    dlq: Arc<dyn DeadLetterQueue>,
) {
    let mut stream = match bus.subscribe(subjects::PAYMENT_AUTHORIZATION_FAILED).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to subscribe to payment failed");
            return;
        }
    };

    while let Some(msg) = stream.next().await {
        let Ok(raw): Result<Value, _> = serde_json::from_slice(&msg.payload) else {
            continue;
        };
        let (correlation_id, _source_module, event_id) = extract_correlation_fields(&raw);
        let span = info_span!("consume_payment_failed", ?event_id, ?correlation_id);

        async {
            let Some(event_id) = event_id else { return };
            if already_processed(&ledger, &event_id).await {
                return;
            }
            let Some(payload) = extract_payload(&raw) else { return };
            let Ok(payload) = serde_json::from_value::<PaymentAuthorizationFailed>(payload.clone()) else {
                error!("could not decode payment failed payload");
                return;
            };

            let result = retry_with_backoff(
                || async {
                    service
                        .handle_payment_failed(payload.invoice_id, payload.reason.clone(), correlation_id.clone())
                        .await
                        .map_err(|e| e.to_string())
                },
                &RetryConfig::default(),
                "handle_payment_failed",
            )
            .await;

            match result {
                Ok(()) => mark_processed(&ledger, &event_id, "payment.authorization.failed").await,
                Err(e) => {
                    error!(error = %e, invoice_id = %payload.invoice_id, "giving up on payment failed after retries");
                    dead_letter(&dlq, &event_id, subjects::PAYMENT_AUTHORIZATION_FAILED, &raw, &e).await;
                }
            }
        }
        .instrument(span)
        .await;
    }
}

/// Records inventory's compensation confirmation as a narrative note
/// (spec.md §4.7: "Billing receives the confirmation and records a note;
/// no state change is required because the invoice is already terminal by
/// then.").
async fn consume_compensation_confirmations(
    bus: Arc<dyn EventBus>,
    service: Arc<BillingService>,
    ledger: Arc<dyn IdempotencyLedger>,
    dlq: Arc<dyn DeadLetterQueue>,
) {
    let mut stream = match bus.subscribe(subjects::INVENTORY_COMPENSATION_RESPONDED).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to subscribe to inventory compensation confirmations");
            return;
        }
    };

    while let Some(msg) = stream.next().await {
        let Ok(raw): Result<Value, _> = serde_json::from_slice(&msg.payload) else {
            continue;
        };
        let (correlation_id, _source_module, event_id) = extract_correlation_fields(&raw);
        let span = info_span!("consume_compensation_confirmation", ?event_id, ?correlation_id);

        async {
            let Some(event_id) = event_id else { return };
            if already_processed(&ledger, &event_id).await {
                return;
            }
            let Some(payload) = extract_payload(&raw) else { return };
            let Ok(payload) = serde_json::from_value::<InventoryCompensationResponded>(payload.clone()) else {
                error!("could not decode inventory compensation confirmation payload");
                return;
            };

            let result = retry_with_backoff(
                || async {
                    service
                        .handle_compensation_confirmed(
                            payload.invoice_id,
                            payload.compensation_successful,
                            payload.error.clone(),
                        )
                        .await
                        .map_err(|e| e.to_string())
                },
                &RetryConfig::default(),
                "handle_compensation_confirmed",
            )
            .await;

            match result {
                Ok(()) => mark_processed(&ledger, &event_id, "inventory.compensation.responded").await,
                Err(e) => {
                    error!(error = %e, invoice_id = %payload.invoice_id, "giving up on compensation confirmation after retries");
                    dead_letter(&dlq, &event_id, subjects::INVENTORY_COMPENSATION_RESPONDED, &raw, &e).await;
                }
            }
        }
        .instrument(span)
        .await;
    }
}

/// Billing votes in distributed customer deletion by checking for any
/// non-terminal invoice against the target customer.
async fn consume_deletion_requests(
    bus: Arc<dyn EventBus>,
    service: Arc<BillingService>,
    ledger: Arc<dyn IdempotencyLedger>,
) {
    let mut stream = match bus.subscribe(subjects::CUSTOMER_DELETION_REQUESTED).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to subscribe to customer deletion requests");
            return;
        }
    };

    while let Some(msg) = stream.next().await {
        let Ok(raw): Result<Value, _> = serde_json::from_slice(&msg.payload) else {
            continue;
        };
        let (correlation_id, _source_module, event_id) = extract_correlation_fields(&raw);

        let Some(event_id) = event_id else { continue };
        if already_processed(&ledger, &event_id).await {
            continue;
        }
        let Some(payload) = extract_payload(&raw) else { continue };
        let Some(customer_id) = payload.get("customer_id").and_then(|v| v.as_str()) else {
            continue;
        };

        let (vote, reason) = match service.evaluate_deletion_vote(customer_id).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, customer_id, "failed to evaluate deletion vote");
                continue;
            }
        };

        let response = crate::events::envelope::CustomerDeletionResponded {
            customer_id: customer_id.to_string(),
            service: crate::events::envelope::SOURCE_MODULE.to_string(),
            vote,
            reason,
        };
        let envelope = crate::events::envelope::build_envelope(
            "platform",
            correlation_id.clone(),
            Some(event_id.clone()),
            response,
        );
        if let Ok(bytes) = serde_json::to_vec(&envelope) {
            if let Err(e) = bus.publish(subjects::CUSTOMER_DELETION_RESPONDED, bytes).await {
                error!(error = %e, customer_id, "failed to publish deletion vote");
                continue;
            }
        }
        mark_processed(&ledger, &event_id, "customer.deletion.requested").await;
    }
}

async fn already_processed(ledger: &Arc<dyn IdempotencyLedger>, event_id: &str) -> bool {
    ledger.is_processed(event_id, PROCESSOR).await.unwrap_or(false)
}

async fn mark_processed(ledger: &Arc<dyn IdempotencyLedger>, event_id: &str, event_type: &str) {
    if let Err(e) = ledger.mark_processed(event_id, event_type, PROCESSOR).await {
        error!(error = %e, event_id, "failed to record idempotency marker");
    }
}
