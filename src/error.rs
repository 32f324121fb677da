//! Request-level error type and its HTTP mapping.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use crate::auth::CredentialError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum CmsError {
    #[error("document store: {0}")]
    Store(#[from] StoreError),
    #[error("credentials: {0}")]
    Credentials(#[from] CredentialError),
    #[error("session middleware not installed")]
    SessionMissing,
}

impl CmsError {
    pub fn status(&self) -> StatusCode {
        match self {
            CmsError::Store(StoreError::InvalidName(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CmsError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
            "Internal Server Error".to_owned()
        } else {
            tracing::warn!(error = %self, "request rejected");
            format!("Bad Request: {self}")
        };
        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        )
            .into_response()
    }
}
