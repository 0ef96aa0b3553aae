//! Inventory has no coordinator-side HTTP surface (spec.md §1 scopes CRUD
//! for items out) — only the `/dapr/subscribe` discovery document alongside
//! the shared `/health` route merged in by `main.rs`.

use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::events::envelope::subjects;

pub fn inventory_router() -> Router {
    Router::new().route("/dapr/subscribe", get(dapr_subscribe))
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
            topic: subjects::INVENTORY_RESERVATION_REQUESTED,
            route: "/events/reservation-request",
        },
        DaprSubscription {
            pubsubname: PUBSUB,
            topic: subjects::INVENTORY_COMPENSATION_REQUESTED,
            route: "/events/compensation-request",
        },
        DaprSubscription {
            pubsubname: PUBSUB,
            topic: subjects::CUSTOMER_DELETION_REQUESTED,
            route: "/events/customer-deletion-request",
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_dapr_subscribe_lists_expected_topics() {
        let app = inventory_router();
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
        assert_eq!(parsed.as_array().unwrap().len(), 3);
    }
}
