//! Payments has no coordinator-side HTTP surface (spec.md §1 scopes any
//! direct payment-initiation API out) — only the `/dapr/subscribe`
//! discovery document alongside the shared `/health` route merged in by
//! `main.rs`.

use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::events::envelope::subjects;

pub fn payments_router() -> Router {
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
            topic: subjects::PAYMENT_AUTHORIZATION_REQUESTED,
            route: "/events/authorization-request",
        },
        DaprSubscription {
            pubsubname: PUBSUB,
            topic: subjects::CUSTOMER_DELETION_REQUESTED,
            route: "/events/customer-deletion-request",
        },
    ])
}
