use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::keystore::KeyStoreError;
use crate::types::ApiResponse;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown party: {0}")]
    UnknownParty(String),

    #[error("Key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Key storage failed: {0}")]
    Storage(String),

    /// Remote ledger text, verbatim
    #[error("{0}")]
    SubmissionFailed(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Ledger error: {0}")]
    Ledger(String),
}

impl ApiError {
    /// Stable machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::InvalidArgument(_) => "invalid_argument",
            ApiError::UnknownParty(_) => "unknown_party",
            ApiError::KeyUnavailable(_) => "key_unavailable",
            ApiError::KeyGeneration(_) => "key_generation",
            ApiError::Storage(_) => "storage",
            ApiError::SubmissionFailed(_) => "submission_failed",
            ApiError::Signing(_) => "signing",
            ApiError::Verification(_) => "verification",
            ApiError::Ledger(_) => "ledger",
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ApiError::InvalidArgument(_) | ApiError::UnknownParty(_)
        )
    }
}

impl From<KeyStoreError> for ApiError {
    fn from(err: KeyStoreError) -> Self {
        match err {
            KeyStoreError::KeyGeneration(msg) => ApiError::KeyGeneration(msg),
            KeyStoreError::Storage(msg) => ApiError::Storage(msg),
            KeyStoreError::KeyParse(msg) => ApiError::KeyUnavailable(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, hint) = match &self {
            ApiError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, None),
            ApiError::UnknownParty(_) => (
                StatusCode::BAD_REQUEST,
                Some("Use a name listed by /api/iou/peers"),
            ),
            ApiError::SubmissionFailed(_) => (StatusCode::BAD_REQUEST, None),
            ApiError::KeyGeneration(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Some("Key size must be between 1024 and 8192 bits"),
            ),
            ApiError::KeyUnavailable(_) | ApiError::Storage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Some("Check the key directory or call /api/iou/generatekeys"),
            ),
            ApiError::Signing(_) | ApiError::Verification(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
            ApiError::Ledger(_) => (
                StatusCode::BAD_GATEWAY,
                Some("The ledger node is unreachable or timed out"),
            ),
        };

        let body = ApiResponse::<()>::error(self.kind(), self.to_string(), hint);
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
