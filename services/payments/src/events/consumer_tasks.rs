//! Subscriptions payments holds on the bus: authorization requests and
//! distributed-deletion votes.

use std::sync::Arc;

use entity_store::{IdempotencyLedger, InMemoryIdempotencyLedger};
use event_bus::consumer_retry::{retry_with_backoff, RetryConfig};
use event_bus::{extract_payload, EventBus};
use futures::StreamExt;
use serde_json::Value;
use tracing::{error, info_span, Instrument};

use crate::events::envelope::{extract_correlation_fields, extract_tenant_id, subjects, PaymentAuthorizationRequested};
use crate::handlers::PaymentsService;

const PROCESSOR: &str = "payment";

pub fn spawn_all(bus: Arc<dyn EventBus>, service: Arc<PaymentsService>, ledger: Arc<dyn IdempotencyLedger>) {
    tokio::spawn(consume_authorization_requests(bus.clone(), service.clone(), ledger.clone()));
    tokio::spawn(consume_deletion_requests(bus, service, ledger));
}

pub fn default_ledger() -> Arc<dyn IdempotencyLedger> {
    Arc::new(InMemoryIdempotencyLedger::new())
}

async fn consume_authorization_requests(
    bus: Arc<dyn EventBus>,
    service: Arc<PaymentsService>,
    ledger: Arc<dyn IdempotencyLedger>,
) {
    let mut stream = match bus.subscribe(subjects::PAYMENT_AUTHORIZATION_REQUESTED).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to subscribe to payment authorization requests");
            return;
        }
    };

    while let Some(msg) = stream.next().await {
        let Ok(raw): Result<Value, _> = serde_json::from_slice(&msg.payload) else {
            error!("payment authorization request payload was not valid JSON");
            continue;
        };
        let (correlation_id, _source_module, event_id) = extract_correlation_fields(&raw);
        let tenant_id = extract_tenant_id(&raw);
        let span = info_span!("consume_authorization_request", ?event_id, ?correlation_id);

        async {
            let Some(event_id) = event_id else { return };
            if already_processed(&ledger, &event_id).await {
                return;
            }
            let Some(payload) = extract_payload(&raw) else { return };
            let Ok(payload) = serde_json::from_value::<PaymentAuthorizationRequested>(payload.clone()) else {
                error!("could not decode payment authorization request payload");
                return;
            };

            let result = retry_with_backoff(
                || async {
                    service
                        .handle_authorization_request(
                            payload.invoice_id,
                            &tenant_id,
                            payload.amount,
                            &payload.customer_id,
                            correlation_id.clone(),
                            Some(event_id.clone()),
                        )
                        .await
                        .map_err(|e| e.to_string())
                },
                &RetryConfig::default(),
                "handle_authorization_request",
            )
            .await;

            match result {
                Ok(()) => mark_processed(&ledger, &event_id, "payment.authorization.requested").await,
                Err(e) => error!(error = %e, invoice_id = %payload.invoice_id, "giving up on authorization request after retries"),
            }
        }
        .instrument(span)
        .await;
    }
}

async fn consume_deletion_requests(
    bus: Arc<dyn EventBus>,
    service: Arc<PaymentsService>,
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

        if let Err(e) = service
            .publish_deletion_vote(customer_id, correlation_id.clone(), Some(event_id.clone()))
            .await
        {
            error!(error = %e, customer_id, "failed to publish deletion vote");
            continue;
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
