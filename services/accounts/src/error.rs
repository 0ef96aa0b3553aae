use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::deletion::RequestDeletionError;

#[derive(Debug, Error)]
pub enum AccountsError {
    #[error("customer not found")]
    NotFound,

    #[error("deletion already in progress for this customer")]
    AlreadyInProgress,

    #[error("customer is already deleted")]
    AlreadyDeleted,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] entity_store::StoreError),

    #[error(transparent)]
    Bus(#[from] event_bus::BusError),
}

impl From<RequestDeletionError> for AccountsError {
    fn from(e: RequestDeletionError) -> Self {
        match e {
            RequestDeletionError::NotFound => AccountsError::NotFound,
            RequestDeletionError::AlreadyInProgress => AccountsError::AlreadyInProgress,
            RequestDeletionError::AlreadyDeleted => AccountsError::AlreadyDeleted,
        }
    }
}

impl IntoResponse for AccountsError {
    fn into_response(self) -> Response {
        let status = match &self {
            AccountsError::NotFound => StatusCode::NOT_FOUND,
            AccountsError::AlreadyInProgress | AccountsError::AlreadyDeleted | AccountsError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            AccountsError::Store(_) | AccountsError::Bus(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
