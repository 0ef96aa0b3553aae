//! Subscriptions accounts holds on the bus.
//!
//! A single task consumes every participant's deletion vote, keyed on the
//! same idempotency ledger pattern `billing::events::consumer_tasks` uses.

use std::sync::Arc;

use entity_store::{IdempotencyLedger, InMemoryIdempotencyLedger};
use event_bus::consumer_retry::{retry_with_backoff, RetryConfig};
use event_bus::{extract_payload, EventBus};
use futures::StreamExt;
use serde_json::Value;
use tracing::{error, info_span, Instrument};

use crate::events::envelope::{
    extract_correlation_fields, subjects, CustomerDeletionResponded, CustomerVerificationRequested, DeletionVote,
};
use crate::handlers::AccountsService;

const PROCESSOR: &str = "accounts";

pub fn spawn_all(bus: Arc<dyn EventBus>, service: Arc<AccountsService>, ledger: Arc<dyn IdempotencyLedger>) {
    tokio::spawn(consume_deletion_responses(bus.clone(), service.clone(), ledger.clone()));
    tokio::spawn(consume_customer_verification_requests(bus, service, ledger));
}

pub fn default_ledger() -> Arc<dyn IdempotencyLedger> {
    Arc::new(InMemoryIdempotencyLedger::new())
}

async fn consume_deletion_responses(
    bus: Arc<dyn EventBus>,
    service: Arc<AccountsService>,
    ledger: Arc<dyn IdempotencyLedger>,
) {
    let mut stream = match bus.subscribe(subjects::CUSTOMER_DELETION_RESPONDED).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to subscribe to customer deletion responses");
            return;
        }
    };

    while let Some(msg) = stream.next().await {
        let Ok(raw): Result<Value, _> = serde_json::from_slice(&msg.payload) else {
            error!("deletion response payload was not valid JSON");
            continue;
        };
        let (correlation_id, _source_module, event_id) = extract_correlation_fields(&raw);
        let span = info_span!("consume_deletion_response", ?event_id, ?correlation_id);

        async {
            let Some(event_id) = event_id else { return };
            if already_processed(&ledger, &event_id).await {
                return;
            }
            let Some(payload) = extract_payload(&raw) else { return };
            let Ok(payload) = serde_json::from_value::<CustomerDeletionResponded>(payload.clone()) else {
                error!("could not decode deletion response payload");
                return;
            };

            let can_delete = payload.vote == DeletionVote::Approve;
            let result = retry_with_backoff(
                || async {
                    service
                        .handle_deletion_response(
                            &payload.customer_id,
                            &payload.service,
                            can_delete,
                            payload.reason.clone(),
                            correlation_id.clone(),
                        )
                        .await
                        .map_err(|e| e.to_string())
                },
                &RetryConfig::default(),
                "handle_deletion_response",
            )
            .await;

            match result {
                Ok(()) => mark_processed(&ledger, &event_id, "customer.deletion.responded").await,
                Err(e) => error!(error = %e, customer_id = %payload.customer_id, "giving up on deletion response after retries"),
            }
        }
        .instrument(span)
        .await;
    }
}

/// Services billing's `customer-check` request alongside the inventory
/// reservation check, the other half of the invoice saga's fan-out.
async fn consume_customer_verification_requests(
    bus: Arc<dyn EventBus>,
    service: Arc<AccountsService>,
    ledger: Arc<dyn IdempotencyLedger>,
) {
    let mut stream = match bus.subscribe(subjects::CUSTOMER_VERIFICATION_REQUESTED).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to subscribe to customer verification requests");
            return;
        }
    };

    while let Some(msg) = stream.next().await {
        let Ok(raw): Result<Value, _> = serde_json::from_slice(&msg.payload) else {
            error!("customer verification request payload was not valid JSON");
            continue;
        };
        let (correlation_id, _source_module, event_id) = extract_correlation_fields(&raw);
        let span = info_span!("consume_customer_verification_request", ?event_id, ?correlation_id);

        async {
            let Some(event_id) = event_id else { return };
            if already_processed(&ledger, &event_id).await {
                return;
            }
            let Some(payload) = extract_payload(&raw) else { return };
            let Ok(payload) = serde_json::from_value::<CustomerVerificationRequested>(payload.clone()) else {
                error!("could not decode customer verification request payload");
                return;
            };

            let result = retry_with_backoff(
                || async {
                    service
                        .handle_customer_verification(
                            payload.invoice_id,
                            &payload.customer_id,
                            payload.customer_email.clone(),
                            correlation_id.clone(),
                        )
                        .await
                        .map_err(|e| e.to_string())
                },
                &RetryConfig::default(),
                "handle_customer_verification",
            )
            .await;

            match result {
                Ok(()) => mark_processed(&ledger, &event_id, "customer.verification.requested").await,
                Err(e) => error!(error = %e, invoice_id = %payload.invoice_id, "giving up on customer verification after retries"),
            }
        }
        .instrument(span)
        .await;
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
