//! Shared `/health` endpoint used by every service binary.
//!
//! Each service mounts [`health_router`] under its own `Router` so that the
//! response shape (`{"status": "healthy", "service": "..."}`) is identical
//! across billing, accounts, inventory and payments, matching the spec's
//! `GET /health` contract (spec.md §6).

use axum::{routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: String,
    pub version: String,
    pub checked_at: DateTime<Utc>,
}

#[derive(Clone)]
struct HealthState {
    service: String,
    version: String,
}

/// Build a `Router` exposing `GET /health` for the given service name.
///
/// `version` is typically `env!("CARGO_PKG_VERSION")` from the calling
/// binary's own `Cargo.toml`.
pub fn health_router(service: impl Into<String>, version: impl Into<String>) -> Router {
    let state = HealthState {
        service: service.into(),
        version: version.into(),
    };

    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler(
    axum::extract::State(state): axum::extract::State<HealthState>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: state.service,
        version: state.version,
        checked_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_endpoint_reports_service_name() {
        let app = health_router("billing", "1.0.0");

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "healthy");
        assert_eq!(parsed["service"], "billing");
        assert_eq!(parsed["version"], "1.0.0");
    }
}
