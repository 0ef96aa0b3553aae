use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PaymentsError {
    #[error("payment not found")]
    NotFound,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] entity_store::StoreError),

    #[error(transparent)]
    Bus(#[from] event_bus::BusError),
}

impl IntoResponse for PaymentsError {
    fn into_response(self) -> Response {
        let status = match &self {
            PaymentsError::NotFound => StatusCode::NOT_FOUND,
            PaymentsError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            PaymentsError::Store(_) | PaymentsError::Bus(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
