//! Error types for the control-plane API client.

use thiserror::Error;

use crate::credentials::CredentialError;

/// Phrase the control plane returns when a stop races task expiry. The
/// matching is inherited, fragile behaviour; it lives only behind
/// [`ApiError::is_task_not_found`] so it can be replaced in one place.
const TASK_NOT_FOUND_MARKER: &str = "task was not found";

/// Errors raised by the API client.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ApiError {
    /// Raised when credentials cannot be obtained.
    #[error("failed to obtain credentials: {0}")]
    Credentials(#[from] CredentialError),
    /// Raised when the request cannot be constructed.
    #[error("failed to build request: {message}")]
    Request {
        /// Human-readable description of the construction failure.
        message: String,
    },
    /// Raised when the request cannot be delivered.
    #[error("transport failure: {message}")]
    Transport {
        /// Human-readable description of the network failure.
        message: String,
    },
    /// Raised when the control plane answers with a non-success status.
    #[error("service returned status {status}: {body}")]
    Service {
        /// HTTP status code of the response.
        status: u16,
        /// Raw response body, kept for diagnostics and classification.
        body: String,
    },
    /// Raised when a response body is not valid JSON.
    #[error("failed to decode response: {message}")]
    Decode {
        /// Human-readable description of the decoding failure.
        message: String,
    },
}

impl ApiError {
    /// True when the control plane reported that the task no longer exists,
    /// which a stop treats as success.
    #[must_use]
    pub fn is_task_not_found(&self) -> bool {
        matches!(self, Self::Service { body, .. } if body.contains(TASK_NOT_FOUND_MARKER))
    }
}
