use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("invoice not found")]
    NotFound,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] entity_store::StoreError),

    #[error(transparent)]
    Bus(#[from] event_bus::BusError),
}

impl IntoResponse for BillingError {
    fn into_response(self) -> Response {
        let status = match &self {
            BillingError::NotFound => StatusCode::NOT_FOUND,
            BillingError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BillingError::Store(_) | BillingError::Bus(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
