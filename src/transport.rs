//! The I/O boundary: one HTTP request in, one response (or failure) out.
//!
//! A [`Transport`] performs exactly one network call per [`Transport::send`]
//! and never interprets status codes. Retrying, reauthentication and decoding
//! live above it.
//!
//! # Implementations
//!
//! - [`HttpTransport`] (feature `http`): `reqwest` with a cookie store.
//! - [`mock::MockTransport`]: scripted responses for tests.

#[cfg(feature = "http")]
mod http;
pub mod mock;

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use thiserror::Error;

use crate::endpoint::Method;

#[cfg(feature = "http")]
pub use self::http::HttpTransport;

/// Error type for transport failures. Status codes are never errors here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// A fully resolved request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    /// Absolute URL without the query string.
    pub url: String,
    /// Query parameters, encoded by the transport.
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// Looks up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        lookup_header(&self.headers, name)
    }
}

/// A response as received; the status is passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// A response carrying a JSON body.
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        let mut response = Self::new(status, body.to_string());
        response
            .headers
            .insert("content-type".to_string(), "application/json".to_string());
        response
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        lookup_header(&self.headers, name)
    }
}

fn lookup_header<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Issues a single HTTP request.
pub trait Transport: Send + Sync {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>>;
}

/// Joins a base URL and a path.
pub(crate) fn build_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_joins_slashes() {
        assert_eq!(
            build_url("https://api.example.com/", "/schools"),
            "https://api.example.com/schools"
        );
        assert_eq!(
            build_url("https://api.example.com/v1", "schools/3"),
            "https://api.example.com/v1/schools/3"
        );
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut request = HttpRequest::new(Method::Get, "http://localhost/");
        request
            .headers
            .insert("Authorization".to_string(), "Bearer T1".to_string());
        assert_eq!(request.header("authorization"), Some("Bearer T1"));
        assert_eq!(request.header("x-csrf-token"), None);
    }

    #[test]
    fn test_response_helpers() {
        let response = HttpResponse::json(201, &serde_json::json!({"data": 1}));
        assert!(response.is_success());
        assert_eq!(response.header("Content-Type"), Some("application/json"));
        assert!(!HttpResponse::new(401, "").is_success());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(TransportError::Timeout.to_string(), "Request timed out");
        assert_eq!(
            TransportError::Network("refused".to_string()).to_string(),
            "Network error: refused"
        );
    }
}
