//! HTTP surface: invoice creation/lookup plus the `/dapr/subscribe`
//! discovery document the original Dapr-based topology expects at startup.
//!
//! Billing's actual event consumption does not depend on Dapr sidecars (see
//! [`crate::events::consumer_tasks`]); this endpoint is kept for wire
//! compatibility and as documentation of which subjects this service binds.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use uuid::Uuid;

use crate::error::BillingError;
use crate::events::envelope::subjects;
use crate::handlers::BillingService;
use crate::models::{CreateInvoiceRequest, InvoiceResponse};

pub fn billing_router(service: Arc<BillingService>) -> Router {
    Router::new()
        .route("/create-invoice", post(create_invoice))
        .route("/invoices/{id}", get(get_invoice))
        .route("/dapr/subscribe", get(dapr_subscribe))
        .with_state(service)
}

async fn create_invoice(
    State(service): State<Arc<BillingService>>,
    Json(req): Json<CreateInvoiceRequest>,
) -> Result<Json<InvoiceResponse>, BillingError> {
    let invoice = service.create_invoice(req).await?;
    Ok(Json(invoice))
}

async fn get_invoice(
    State(service): State<Arc<BillingService>>,
    Path(id): Path<Uuid>,
) -> Result<Json<InvoiceResponse>, BillingError> {
    let invoice = service.get_invoice(id).await?;
    Ok(Json(invoice))
}

#[derive(Debug, Serialize)]
struct DaprSubscription {
    pubsubname: &'static str,
    topic: &'static str,
    route: &'static str,
}

async fn dapr_subscribe() -> Json<Vec<DaprSubscription>> {
    const PUBSUB: &str = "rabbitmq-pubsub";
    Json(vec![
        DaprSubscription {
            pubsubname: PUBSUB,
            topic: subjects::INVENTORY_RESERVATION_RESPONDED,
            route: "/events/inventory-response",
        },
        DaprSubscription {
            pubsubname: PUBSUB,
            topic: subjects::CUSTOMER_VERIFICATION_RESPONDED,
            route: "/events/customer-response",
        },
        DaprSubscription {
            pubsubname: PUBSUB,
            topic: subjects::PAYMENT_AUTHORIZATION_SUCCEEDED,
            route: "/events/payment-completed",
        },
        DaprSubscription {
            pubsubname: PUBSUB,
            topic: subjects::PAYMENT_AUTHORIZATION_FAILED,
            route: "/events/payment-failed",
        },
        DaprSubscription {
            pubsubname: PUBSUB,
            topic: subjects::CUSTOMER_DELETION_REQUESTED,
            route: "/events/customer-deletion-request",
        },
        DaprSubscription {
            pubsubname: PUBSUB,
            topic: subjects::INVENTORY_COMPENSATION_RESPONDED,
            route: "/events/inventory-compensated",
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::outbox::DirectOutbox;
    use crate::store::InMemoryInvoiceStore;
    use crate::timers::TimerWheel;
    use event_bus::InMemoryBus;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_service() -> Arc<BillingService> {
        let bus = Arc::new(InMemoryBus::new());
        let (timers, _fired) = TimerWheel::spawn();
        Arc::new(BillingService::new(
            Arc::new(InMemoryInvoiceStore::new()),
            Arc::new(DirectOutbox::new(bus)),
            Arc::new(timers),
        ))
    }

    #[tokio::test]
    async fn test_create_invoice_returns_pending_then_processing() {
        let app = billing_router(test_service());

        let body = serde_json::json!({
            "tenant_id": "tenant-a",
            "customer_id": "cust-1",
            "customer_email": "cust-1@example.com",
            "items": [{"product_id": "sku-1", "quantity": 2, "unit_price": "10.00"}]
        });

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/create-invoice")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["status"], "PROCESSING");
        assert_eq!(parsed["total_amount"], "20.00");
    }

    #[tokio::test]
    async fn test_get_missing_invoice_is_404() {
        let app = billing_router(test_service());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/invoices/{}", Uuid::new_v4()))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dapr_subscribe_lists_expected_topics() {
        let app = billing_router(test_service());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/dapr/subscribe")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 6);
    }
}
