//! Credential attachment and one-shot refresh-and-replay on 401.
//!
//! # Algorithm
//!
//! 1. Attach the current credentials (if any) and send the request.
//! 2. On a 401, obtain fresh credentials: if the token store changed since the
//!    request was sent, use what is there now; otherwise join the single
//!    in-flight refresh for that generation, starting it if nobody has.
//! 3. On refresh success, store the new pair and replay the request once.
//! 4. On refresh failure, clear the store, publish [`SessionEvent::Expired`]
//!    and fail with [`ApiError::Unauthenticated`].
//!
//! Any other response is returned as-is. Nothing is retried beyond the single
//! replay.

use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::endpoint::RequestSpec;
use crate::envelope;
use crate::error::ApiError;
use crate::session::{CredentialPair, SessionEvent, TokenStore};
use crate::transport::{HttpRequest, HttpResponse, Transport, build_url};

/// Status code that signals expired or missing credentials.
pub const UNAUTHORIZED: u16 = 401;

type SharedRefresh = Shared<BoxFuture<'static, Result<CredentialPair, ApiError>>>;

struct Inner {
    transport: Arc<dyn Transport>,
    tokens: TokenStore,
    base_url: String,
    refresh_path: String,
    csrf_header: String,
    // The refresh started for a given credential generation.
    refresh: Mutex<Option<(u64, SharedRefresh)>>,
}

/// Sends requests with credentials attached, refreshing them at most once per
/// credential generation.
#[derive(Clone)]
pub struct ReauthPolicy {
    inner: Arc<Inner>,
}

impl ReauthPolicy {
    pub fn new(
        transport: Arc<dyn Transport>,
        tokens: TokenStore,
        base_url: impl Into<String>,
        refresh_path: impl Into<String>,
        csrf_header: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                tokens,
                base_url: base_url.into(),
                refresh_path: refresh_path.into(),
                csrf_header: csrf_header.into(),
                refresh: Mutex::new(None),
            }),
        }
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.inner.tokens
    }

    /// Sends `spec`, transparently refreshing credentials once on a 401.
    ///
    /// # Errors
    ///
    /// [`ApiError::Network`] when the transport fails, and
    /// [`ApiError::Unauthenticated`] when the refresh fails.
    pub async fn execute(&self, spec: &RequestSpec) -> Result<HttpResponse, ApiError> {
        let snapshot = self.inner.tokens.snapshot();
        let response = self.send(spec, snapshot.credentials.as_ref()).await?;
        if response.status != UNAUTHORIZED || spec.skip_reauth {
            return Ok(response);
        }

        tracing::debug!(
            method = %spec.method,
            path = %spec.path,
            generation = snapshot.generation,
            "request rejected with 401, refreshing credentials"
        );
        let credentials = self.credentials_after(snapshot.generation).await?;
        self.send(spec, Some(&credentials)).await
    }

    /// Resolves the credentials that supersede `failed_generation`.
    async fn credentials_after(&self, failed_generation: u64) -> Result<CredentialPair, ApiError> {
        let refresh = {
            let mut slot = self
                .inner
                .refresh
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);

            let current = self.inner.tokens.snapshot();
            if current.generation != failed_generation {
                // Someone already refreshed (or cleared) after our request left.
                return current.credentials.ok_or(ApiError::Unauthenticated);
            }

            let pending = slot
                .as_ref()
                .filter(|(generation, _)| *generation == failed_generation)
                .map(|(_, refresh)| refresh.clone());
            match pending {
                Some(refresh) => refresh,
                None => {
                    let refresh = self.clone().refresh().boxed().shared();
                    *slot = Some((failed_generation, refresh.clone()));
                    refresh
                }
            }
        };
        refresh.await
    }

    async fn refresh(self) -> Result<CredentialPair, ApiError> {
        let spec = RequestSpec::post(self.inner.refresh_path.clone()).skip_reauth();
        let current = self.inner.tokens.get();
        let result = match self.send(&spec, current.as_ref()).await {
            Ok(response) => envelope::decode::<CredentialPair>(&response),
            Err(e) => Err(e),
        };

        match result {
            Ok(credentials) => {
                self.inner.tokens.set(credentials.clone());
                self.inner.tokens.notify(SessionEvent::Refreshed);
                Ok(credentials)
            }
            Err(e) => {
                tracing::warn!(error = %e, "credential refresh failed, clearing session");
                self.inner.tokens.clear();
                self.inner.tokens.notify(SessionEvent::Expired);
                Err(ApiError::Unauthenticated)
            }
        }
    }

    async fn send(
        &self,
        spec: &RequestSpec,
        credentials: Option<&CredentialPair>,
    ) -> Result<HttpResponse, ApiError> {
        let request = self.build_request(spec, credentials)?;
        self.inner
            .transport
            .send(request)
            .await
            .map_err(|e| ApiError::Network(e.to_string()))
    }

    fn build_request(
        &self,
        spec: &RequestSpec,
        credentials: Option<&CredentialPair>,
    ) -> Result<HttpRequest, ApiError> {
        let url = build_url(&self.inner.base_url, &spec.path);
        let mut request = HttpRequest::new(spec.method, url);
        request.query.clone_from(&spec.query);
        request
            .headers
            .insert("Accept".to_string(), "application/json".to_string());

        if let Some(body) = &spec.body {
            let body = body.as_ref().map_err(|e| ApiError::Serialize(e.clone()))?;
            let bytes = serde_json::to_vec(body).map_err(|e| ApiError::Serialize(e.to_string()))?;
            request.body = Some(bytes);
            request
                .headers
                .insert("Content-Type".to_string(), "application/json".to_string());
        }

        if let Some(credentials) = credentials {
            request.headers.insert(
                "Authorization".to_string(),
                format!("Bearer {}", credentials.access_token),
            );
            request
                .headers
                .insert(self.inner.csrf_header.clone(), credentials.csrf_token.clone());
        }

        Ok(request)
    }
}

impl std::fmt::Debug for ReauthPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReauthPolicy")
            .field("base_url", &self.inner.base_url)
            .field("refresh_path", &self.inner.refresh_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Method;
    use crate::transport::mock::MockTransport;
    use serde_json::json;
    use std::time::Duration;

    const BASE: &str = "http://localhost/api";

    fn policy(mock: &MockTransport, tokens: &TokenStore) -> ReauthPolicy {
        ReauthPolicy::new(
            Arc::new(mock.clone()),
            tokens.clone(),
            BASE,
            "/auth/refresh",
            "X-CSRF-Token",
        )
    }

    /// `/me` accepts only the given access token.
    fn protect_me(mock: &MockTransport, valid: &'static str) {
        mock.on(Method::Get, "/api/me", move |request| {
            let expected = format!("Bearer {valid}");
            if request.header("authorization") == Some(expected.as_str()) {
                Ok(HttpResponse::json(200, &json!({"data": "kim"})))
            } else {
                Ok(HttpResponse::json(401, &json!({"error": {"code": "EXPIRED"}})))
            }
        });
    }

    #[tokio::test]
    async fn test_attaches_credentials() {
        let mock = MockTransport::new();
        mock.on_json(Method::Get, "/api/me", 200, json!({"data": "kim"}));
        let tokens = TokenStore::new();
        tokens.set(CredentialPair::new("T1", "C1"));

        let response = policy(&mock, &tokens)
            .execute(&RequestSpec::get("/me"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);

        let call = &mock.calls()[0];
        assert_eq!(call.url, "http://localhost/api/me");
        assert_eq!(call.header("Authorization"), Some("Bearer T1"));
        assert_eq!(call.header("X-CSRF-Token"), Some("C1"));
    }

    #[tokio::test]
    async fn test_unauthenticated_request_has_no_auth_headers() {
        let mock = MockTransport::new();
        mock.on_json(Method::Get, "/api/schools", 200, json!({"data": []}));

        policy(&mock, &TokenStore::new())
            .execute(&RequestSpec::get("/schools"))
            .await
            .unwrap();
        assert_eq!(mock.calls()[0].header("Authorization"), None);
    }

    #[tokio::test]
    async fn test_non_auth_failures_pass_through() {
        let mock = MockTransport::new();
        mock.on_json(Method::Get, "/api/boom", 500, json!({"error": {"code": "E"}}));

        let response = policy(&mock, &TokenStore::new())
            .execute(&RequestSpec::get("/boom"))
            .await
            .unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(mock.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_and_replay() {
        let mock = MockTransport::new();
        protect_me(&mock, "T2");
        mock.on_json(
            Method::Post,
            "/api/auth/refresh",
            200,
            json!({"data": {"accessToken": "T2", "csrfToken": "C2"}}),
        );
        let tokens = TokenStore::new();
        tokens.set(CredentialPair::new("T1", "C1"));
        let mut events = tokens.events();

        let response = policy(&mock, &tokens)
            .execute(&RequestSpec::get("/me"))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(tokens.get(), Some(CredentialPair::new("T2", "C2")));
        assert_eq!(mock.call_count(Method::Get, "/api/me"), 2);
        assert_eq!(mock.call_count(Method::Post, "/api/auth/refresh"), 1);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Refreshed);

        let replay = &mock.calls_to(Method::Get, "/api/me")[1];
        assert_eq!(replay.header("X-CSRF-Token"), Some("C2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_401s_share_one_refresh() {
        let mock = MockTransport::new();
        mock.set_delay(Duration::from_millis(50));
        protect_me(&mock, "T2");
        mock.on_json(
            Method::Post,
            "/api/auth/refresh",
            200,
            json!({"data": {"accessToken": "T2", "csrfToken": "C2"}}),
        );
        let tokens = TokenStore::new();
        tokens.set(CredentialPair::new("T1", "C1"));
        let policy = policy(&mock, &tokens);

        let spec = RequestSpec::get("/me");
        let results = futures::future::join_all((0..5).map(|_| policy.execute(&spec))).await;

        for result in results {
            assert_eq!(result.unwrap().status, 200);
        }
        assert_eq!(mock.call_count(Method::Post, "/api/auth/refresh"), 1);
        let replays: Vec<_> = mock
            .calls_to(Method::Get, "/api/me")
            .into_iter()
            .filter(|call| call.header("authorization") == Some("Bearer T2"))
            .collect();
        assert_eq!(replays.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_clears_session() {
        let mock = MockTransport::new();
        mock.set_delay(Duration::from_millis(10));
        protect_me(&mock, "never");
        mock.on_json(
            Method::Post,
            "/api/auth/refresh",
            401,
            json!({"error": {"code": "SESSION_GONE"}}),
        );
        let tokens = TokenStore::new();
        tokens.set(CredentialPair::new("T1", "C1"));
        let mut events = tokens.events();
        let policy = policy(&mock, &tokens);

        let spec = RequestSpec::get("/me");
        let results = futures::future::join_all((0..3).map(|_| policy.execute(&spec))).await;

        for result in results {
            assert_eq!(result.unwrap_err(), ApiError::Unauthenticated);
        }
        assert!(tokens.get().is_none());
        assert_eq!(mock.call_count(Method::Post, "/api/auth/refresh"), 1);
        assert_eq!(mock.call_count(Method::Get, "/api/me"), 3);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Expired);
    }

    #[tokio::test]
    async fn test_replayed_401_is_returned_without_second_refresh() {
        let mock = MockTransport::new();
        protect_me(&mock, "never");
        mock.on_json(
            Method::Post,
            "/api/auth/refresh",
            200,
            json!({"data": {"accessToken": "T2", "csrfToken": "C2"}}),
        );
        let tokens = TokenStore::new();

        let response = policy(&mock, &tokens)
            .execute(&RequestSpec::get("/me"))
            .await
            .unwrap();
        assert_eq!(response.status, 401);
        assert_eq!(mock.call_count(Method::Post, "/api/auth/refresh"), 1);
        assert_eq!(mock.call_count(Method::Get, "/api/me"), 2);
    }

    #[tokio::test]
    async fn test_skip_reauth_never_refreshes() {
        let mock = MockTransport::new();
        mock.on_json(Method::Post, "/api/auth/login", 401, json!({"error": {"code": "BAD"}}));

        let response = policy(&mock, &TokenStore::new())
            .execute(&RequestSpec::post("/auth/login").skip_reauth())
            .await
            .unwrap();
        assert_eq!(response.status, 401);
        assert_eq!(mock.call_count(Method::Post, "/api/auth/refresh"), 0);
    }

    #[tokio::test]
    async fn test_stale_401_reuses_newer_credentials() {
        let mock = MockTransport::new();
        protect_me(&mock, "T2");
        let tokens = TokenStore::new();
        tokens.set(CredentialPair::new("T1", "C1"));
        let policy = policy(&mock, &tokens);

        // The store moves on while the first request is in flight.
        let failed_generation = tokens.generation();
        tokens.set(CredentialPair::new("T2", "C2"));

        let credentials = policy.credentials_after(failed_generation).await.unwrap();
        assert_eq!(credentials, CredentialPair::new("T2", "C2"));
        assert_eq!(mock.call_count(Method::Post, "/api/auth/refresh"), 0);
    }

    #[tokio::test]
    async fn test_unserializable_body_is_never_sent() {
        let mock = MockTransport::new();
        let body: std::collections::HashMap<(u8, u8), u8> = [((1, 2), 3)].into_iter().collect();

        let err = policy(&mock, &TokenStore::new())
            .execute(&RequestSpec::post("/schools/3/reviews").json(&body))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Serialize(_)));
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_query_pairs_travel_with_the_request() {
        let mock = MockTransport::new();
        mock.on_json(Method::Get, "/api/schools", 200, json!({"data": []}));

        policy(&mock, &TokenStore::new())
            .execute(&RequestSpec::get("/schools").query("keyword", "해님 유치원").query("page", 2))
            .await
            .unwrap();
        let call = &mock.calls()[0];
        assert_eq!(call.url, "http://localhost/api/schools");
        assert_eq!(
            call.query,
            vec![
                ("keyword".to_string(), "해님 유치원".to_string()),
                ("page".to_string(), "2".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_transport_failure_is_network_error() {
        let mock = MockTransport::new();
        mock.on(Method::Get, "/api/me", |_| {
            Err(crate::transport::TransportError::Timeout)
        });

        let err = policy(&mock, &TokenStore::new())
            .execute(&RequestSpec::get("/me"))
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::Network("Request timed out".to_string()));
    }
}
