use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportError;

/// Error type for configuration loading and client construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },

    #[error("No transport configured and the `http` feature is disabled")]
    MissingTransport,

    #[error("Transport setup failed: {0}")]
    Transport(#[from] TransportError),
}

/// Configuration for query behavior.
///
/// This controls how long cached data counts as fresh and how long unused
/// entries are kept around.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryConfig {
    /// How long data is considered fresh after a fetch.
    ///
    /// A new subscriber to fresh data just receives the cached value. Once
    /// stale, subscribing shows the cached value and refetches in the background.
    #[serde(with = "millis")]
    pub stale_time: Duration,

    /// How long an entry without subscribers is retained before eviction.
    ///
    /// Re-subscribing within this window reuses the entry (rapid remounts).
    #[serde(with = "millis")]
    pub keep_unused_for: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(60),
            keep_unused_for: Duration::from_secs(60),
        }
    }
}

impl QueryConfig {
    /// Creates a new query configuration with the given stale and retention times.
    #[must_use]
    pub const fn new(stale_time: Duration, keep_unused_for: Duration) -> Self {
        Self {
            stale_time,
            keep_unused_for,
        }
    }
}

/// Configuration of an [`ApiClient`](crate::client::ApiClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Base URL every endpoint path is joined onto.
    pub base_url: String,
    /// Per-request transport timeout.
    #[serde(with = "millis")]
    pub timeout: Duration,
    /// Path of the credential refresh endpoint.
    pub refresh_path: String,
    /// Path of the logout endpoint.
    pub logout_path: String,
    /// Header carrying the anti-forgery token.
    pub csrf_header: String,
    /// Namespace of the persisted state key (`persist:<namespace>`).
    pub persist_namespace: String,
    pub query: QueryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            timeout: Duration::from_secs(10),
            refresh_path: "/auth/refresh".to_string(),
            logout_path: "/auth/logout".to_string(),
            csrf_header: "X-CSRF-Token".to_string(),
            persist_namespace: "root".to_string(),
            query: QueryConfig::default(),
        }
    }
}

impl ClientConfig {
    pub const ENV_BASE_URL: &'static str = "KINDER_API_BASE_URL";
    pub const ENV_TIMEOUT_MS: &'static str = "KINDER_API_TIMEOUT_MS";

    /// Default configuration overridden by `KINDER_API_BASE_URL` and
    /// `KINDER_API_TIMEOUT_MS` when set.
    ///
    /// # Errors
    ///
    /// Returns an error if the timeout is not a whole number of milliseconds.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(base_url) = lookup(Self::ENV_BASE_URL) {
            config.base_url = base_url;
        }
        if let Some(raw) = lookup(Self::ENV_TIMEOUT_MS) {
            let millis = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                var: Self::ENV_TIMEOUT_MS.to_string(),
                value: raw.clone(),
            })?;
            config.timeout = Duration::from_millis(millis);
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_query(mut self, query: QueryConfig) -> Self {
        self.query = query;
        self
    }

    #[must_use]
    pub fn with_persist_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.persist_namespace = namespace.into();
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_query_config() {
        let config = QueryConfig::default();
        assert_eq!(config.stale_time, Duration::from_secs(60));
        assert_eq!(config.keep_unused_for, Duration::from_secs(60));
    }

    #[test]
    fn test_new_query_config() {
        let config = QueryConfig::new(Duration::from_secs(30), Duration::from_secs(300));
        assert_eq!(config.stale_time, Duration::from_secs(30));
        assert_eq!(config.keep_unused_for, Duration::from_secs(300));
    }

    #[test]
    fn test_client_config_from_json_fills_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"baseUrl": "https://kinder.example.com/api", "query": {"staleTime": 5000}}"#,
        )
        .unwrap();

        assert_eq!(config.base_url, "https://kinder.example.com/api");
        assert_eq!(config.query.stale_time, Duration::from_secs(5));
        assert_eq!(config.query.keep_unused_for, Duration::from_secs(60));
        assert_eq!(config.refresh_path, "/auth/refresh");
        assert_eq!(config.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_client_config_serializes_millis() {
        let config = ClientConfig::default().with_timeout(Duration::from_millis(2500));
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["timeout"], 2500);
        assert_eq!(value["csrfHeader"], "X-CSRF-Token");
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = ClientConfig::from_lookup(|var| match var {
            "KINDER_API_BASE_URL" => Some("http://10.0.0.2/api".to_string()),
            "KINDER_API_TIMEOUT_MS" => Some("1500".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.base_url, "http://10.0.0.2/api");
        assert_eq!(config.timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_from_lookup_rejects_bad_timeout() {
        let err = ClientConfig::from_lookup(|var| {
            (var == "KINDER_API_TIMEOUT_MS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                var: "KINDER_API_TIMEOUT_MS".to_string(),
                value: "soon".to_string(),
            }
        );
    }
}
