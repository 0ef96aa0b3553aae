//! HTTP surface: deletion-protocol endpoints plus the `/dapr/subscribe`
//! discovery document, mirroring `billing::routes`.
//!
//! Customer CRUD is out of scope (spec.md §1) — there is deliberately no
//! `POST /customers` here; tests and fixtures seed customers directly
//! through [`crate::store::CustomerStore`].

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::error::AccountsError;
use crate::events::envelope::subjects;
use crate::handlers::AccountsService;
use crate::models::DeletionStatusResponse;

pub fn accounts_router(service: Arc<AccountsService>) -> Router {
    Router::new()
        .route("/customers/{id}", delete(request_deletion))
        .route("/customers/{id}/reset-deletion", post(reset_deletion))
        .route("/customers/{id}/deletion-status", get(deletion_status))
        .route("/dapr/subscribe", get(dapr_subscribe))
        .with_state(service)
}

async fn request_deletion(
    State(service): State<Arc<AccountsService>>,
    Path(id): Path<String>,
) -> Result<Json<DeletionStatusResponse>, AccountsError> {
    let status = service.request_deletion(&id).await?;
    Ok(Json(status))
}

/// Test fixture (spec.md §6): unconditionally resets a customer to
/// `ACTIVE` with its deletion state cleared, bypassing the protocol.
async fn reset_deletion(
    State(service): State<Arc<AccountsService>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AccountsError> {
    service.reset_deletion(&id).await?;
    Ok(Json(serde_json::json!({ "reset": true })))
}

async fn deletion_status(
    State(service): State<Arc<AccountsService>>,
    Path(id): Path<String>,
) -> Result<Json<DeletionStatusResponse>, AccountsError> {
    let status = service.deletion_status(&id).await?;
    Ok(Json(status))
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
            topic: subjects::CUSTOMER_DELETION_RESPONDED,
            route: "/events/customer-deletion-response",
        },
        DaprSubscription {
            pubsubname: PUBSUB,
            topic: subjects::CUSTOMER_VERIFICATION_REQUESTED,
            route: "/customer-check",
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::outbox::DirectOutbox;
    use crate::models::Customer;
    use crate::store::{CustomerStore, InMemoryCustomerStore};
    use crate::timers::TimerWheel;
    use event_bus::InMemoryBus;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_service() -> (Arc<AccountsService>, Arc<dyn CustomerStore>) {
        let bus = Arc::new(InMemoryBus::new());
        let (timers, _fired) = TimerWheel::spawn();
        let store: Arc<dyn CustomerStore> = Arc::new(InMemoryCustomerStore::new());
        let service = Arc::new(AccountsService::new(
            store.clone(),
            Arc::new(DirectOutbox::new(bus)),
            Arc::new(timers),
            vec!["billing".to_string(), "inventory".to_string(), "payment".to_string()],
            60,
        ));
        (service, store)
    }

    #[tokio::test]
    async fn test_request_deletion_moves_to_pending() {
        let (service, store) = test_service().await;
        store
            .insert(&Customer::new(
                "cust-1".to_string(),
                "a@example.com".to_string(),
                "Ada".to_string(),
                "Lovelace".to_string(),
            ))
            .await
            .unwrap();

        let app = accounts_router(service);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/customers/cust-1")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["status"], "PENDING_DELETION");
    }

    #[tokio::test]
    async fn test_request_deletion_missing_customer_is_404() {
        let (service, _store) = test_service().await;
        let app = accounts_router(service);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/customers/does-not-exist")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dapr_subscribe_lists_expected_topics() {
        let (service, _store) = test_service().await;
        let app = accounts_router(service);
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
        assert_eq!(parsed.as_array().unwrap().len(), 2);
    }
}
