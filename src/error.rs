//! Error taxonomy for API calls.
//!
//! Every query and mutation resolves with either its data or one of the
//! [`ApiError`] variants below. Errors are `Clone` because a single failed
//! fetch may be observed by several joined callers at once.

use std::collections::BTreeMap;

use thiserror::Error;

/// Field name to list of messages, as reported by the server.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Error type for query and mutation operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The transport could not reach the server (or timed out).
    #[error("Network error: {0}")]
    Network(String),

    /// Credentials are missing or expired and could not be refreshed.
    #[error("Unauthenticated")]
    Unauthenticated,

    /// A 4xx response other than 401, or an error envelope on a 2xx response.
    #[error("Validation error ({status}): {message}")]
    Validation {
        status: u16,
        code: String,
        message: String,
        fields: FieldErrors,
    },

    /// A 5xx response.
    #[error("Server error ({status}): {message}")]
    Server {
        status: u16,
        code: String,
        message: String,
    },

    /// The response body did not match the expected envelope or payload shape.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Request parameters could not be serialized.
    #[error("Serialize error: {0}")]
    Serialize(String),
}

impl ApiError {
    /// Returns `true` if this error means the session is gone and the user
    /// must log in again.
    pub const fn is_unauthenticated(&self) -> bool {
        matches!(self, Self::Unauthenticated)
    }

    /// Returns `true` if a user-triggered retry might succeed.
    ///
    /// Nothing in this crate retries automatically; this only informs the UI.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Server { .. })
    }

    /// Returns the HTTP status carried by the error, if any.
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Validation { status, .. } | Self::Server { status, .. } => Some(*status),
            Self::Unauthenticated => Some(401),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
