//! The query/mutation executor.
//!
//! [`ApiClient`] ties the pieces together: requests go through the
//! [`ReauthPolicy`], responses are decoded by [`envelope::decode`], query
//! results land in the [`Cache`] under the tags their endpoint provides, and
//! successful mutations purge the tags they invalidate.
//!
//! # De-duplication
//!
//! Fetches are keyed by [`CacheKey`]. Whether a caller joins an in-flight
//! fetch or starts a new one is decided inside a single synchronous map
//! operation, so concurrent identical queries cause exactly one transport
//! call. The fetch itself runs on a spawned task and completes even if every
//! subscriber goes away.
//!
//! A key never has two requests on the wire. Invalidating a key whose fetch
//! is in flight queues one more request after the running one, and the
//! fetch's callers receive the result of that last request.
//!
//! # Example
//!
//! ```no_run
//! use futures::StreamExt;
//! use kinder_client::ApiClient;
//! use kinder_client::kindergarten::endpoints;
//! use kinder_client::kindergarten::models::SchoolId;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ApiClient::builder().build()?;
//!
//! let mut school = client.query(&endpoints::school(), SchoolId(42));
//! while let Some(result) = school.next().await {
//!     if let Some(school) = result.data() {
//!         println!("{} ({:?})", school.name, school.status);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Every operation that may start a fetch must be called from within a tokio
//! runtime.

pub mod mutation;
pub mod query;

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::cache::{Cache, CacheKey, Erased, PurgeOutcome, Refetch};
use crate::config::{ClientConfig, ConfigError};
use crate::endpoint::{
    MutationEndpoint, QueryEndpoint, RequestSpec, SessionEffect, Tag, serialize_params,
};
use crate::envelope;
use crate::error::ApiError;
use crate::persist::{PersistError, Persistor, StateStore};
use crate::reauth::ReauthPolicy;
use crate::session::{SessionEvent, TokenStore};
use crate::transport::Transport;

pub use self::mutation::{MutationResult, MutationState};
pub use self::query::{QueryResult, QueryState, QueryStream};

type SharedFetch = Shared<BoxFuture<'static, Result<Erased, ApiError>>>;

struct InFlight {
    id: u64,
    fetch: SharedFetch,
    // Request again once the current response arrives.
    rerun: bool,
    // Tags purged since the current request was sent.
    invalidated: Vec<Tag>,
}

impl InFlight {
    fn new(id: u64, fetch: SharedFetch) -> Self {
        Self {
            id,
            fetch,
            rerun: false,
            invalidated: Vec::new(),
        }
    }

    fn is_outdated_by(&self, provided: &[Tag]) -> bool {
        self.rerun
            || self
                .invalidated
                .iter()
                .any(|tag| provided.iter().any(|provided| tag.matches(provided)))
    }
}

struct ClientInner {
    config: ClientConfig,
    reauth: ReauthPolicy,
    tokens: TokenStore,
    cache: Cache,
    in_flight: DashMap<CacheKey, InFlight>,
    next_fetch: AtomicU64,
    persistor: Option<Persistor>,
}

/// Cloneable handle to the API: cache, credentials and transport.
///
/// Create one at startup with [`ApiClient::builder`] and end it with
/// [`ApiClient::logout`] or [`ApiClient::shutdown`].
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl ApiClient {
    pub fn builder() -> ApiClientBuilder {
        ApiClientBuilder::default()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &Cache {
        &self.inner.cache
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.inner.tokens
    }

    /// Subscribes to session lifecycle events.
    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.tokens.events()
    }

    /// Session events as a stream. Events missed by a slow reader are skipped.
    pub fn session_event_stream(&self) -> impl Stream<Item = SessionEvent> + Send + 'static {
        BroadcastStream::new(self.inner.tokens.events()).filter_map(|event| async move { event.ok() })
    }

    /// Subscribes to the result of `endpoint` for `params`.
    ///
    /// The stream yields the current state at once. A missing or stale entry
    /// triggers a (de-duplicated) fetch. Dropping the stream releases the
    /// subscription; the entry is evicted after
    /// [`QueryConfig::keep_unused_for`](crate::config::QueryConfig::keep_unused_for)
    /// unless it is subscribed again.
    pub fn query<P, T>(&self, endpoint: &QueryEndpoint<P, T>, params: P) -> QueryStream<T>
    where
        P: Serialize + Send + Sync + 'static,
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let key = match Self::key_for(endpoint.id(), &params) {
            Ok(key) => key,
            Err(e) => return QueryStream::failed(e),
        };
        let params = Arc::new(params);
        let subscription = self.inner.cache.subscribe(key.clone());
        self.inner.cache.set_refetch_if_absent(key.clone(), || {
            self.refetch_hook(endpoint, params.clone(), key.clone())
        });

        if subscription
            .current()
            .needs_fetch(self.inner.config.query.stale_time)
        {
            // The spawned task drives the fetch; the stream observes the cache.
            drop(self.fetch_shared(endpoint, params, key, false));
        }
        QueryStream::new(subscription)
    }

    /// Returns the value of `endpoint` for `params` once.
    ///
    /// A fresh cached value is returned without a request; otherwise the
    /// caller joins or starts the fetch for this key.
    ///
    /// # Errors
    ///
    /// Any [`ApiError`] produced while fetching.
    pub async fn fetch<P, T>(&self, endpoint: &QueryEndpoint<P, T>, params: P) -> Result<T, ApiError>
    where
        P: Serialize + Send + Sync + 'static,
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let key = Self::key_for(endpoint.id(), &params)?;
        if let Some(entry) = self.inner.cache.lookup(&key)
            && !entry.needs_fetch(self.inner.config.query.stale_time)
            && let Some(value) = entry.data_as::<T>()
        {
            return Ok(value.clone());
        }

        let value = self
            .fetch_shared(endpoint, Arc::new(params), key, false)
            .await?;
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| ApiError::Decode("cached value has an unexpected type".to_string()))
    }

    /// Performs a write and, on success, applies its session effect and
    /// purges the tags it invalidates.
    ///
    /// # Errors
    ///
    /// Any [`ApiError`] from the request. Nothing is invalidated on failure.
    pub async fn mutate<P, T>(&self, endpoint: &MutationEndpoint<P, T>, params: P) -> Result<T, ApiError>
    where
        P: 'static,
        T: DeserializeOwned + 'static,
    {
        let spec = endpoint.build_request(&params);
        let response = self.inner.reauth.execute(&spec).await?;
        let result: T = envelope::decode(&response)?;
        tracing::debug!(mutation = endpoint.id(), "mutation succeeded");

        match endpoint.session_effect() {
            SessionEffect::None => {}
            SessionEffect::Establish(credentials) => {
                self.inner.tokens.set(credentials(&result));
                self.inner.tokens.notify(SessionEvent::Established);
            }
            SessionEffect::Clear => self.end_session(),
        }

        let tags = endpoint.invalidated_tags(&params, &result);
        self.purge(&tags);
        Ok(result)
    }

    /// Like [`mutate`](Self::mutate), reported as `Loading` followed by the
    /// outcome.
    pub fn mutate_tracked<P, T>(
        &self,
        endpoint: &MutationEndpoint<P, T>,
        params: P,
    ) -> BoxStream<'static, MutationResult<T>>
    where
        P: Send + 'static,
        T: DeserializeOwned + Send + 'static,
    {
        let client = self.clone();
        let endpoint = endpoint.clone();
        stream::once(async { MutationResult::loading() })
            .chain(stream::once(async move {
                MutationResult::from(client.mutate(&endpoint, params).await)
            }))
            .boxed()
    }

    /// Invalidates cached results by tag, as a mutation would.
    ///
    /// Fetches in flight whose response would provide one of `tags`, or
    /// whose entry gets evicted, request again before settling.
    pub fn invalidate_tags(&self, tags: &[Tag]) -> PurgeOutcome {
        self.purge(tags)
    }

    /// Ends the session: notifies the server, then clears credentials,
    /// persisted state and the cache.
    ///
    /// The local session is cleared even when the server call fails.
    ///
    /// # Errors
    ///
    /// The server error, except [`ApiError::Unauthenticated`] which means the
    /// session was already gone.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let spec = RequestSpec::post(self.inner.config.logout_path.clone()).skip_reauth();
        let result = match self.inner.reauth.execute(&spec).await {
            Ok(response) => envelope::decode::<serde_json::Value>(&response).map(drop),
            Err(e) => Err(e),
        };
        self.end_session();

        match result {
            Ok(()) | Err(ApiError::Unauthenticated) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "logout request failed, session cleared locally");
                Err(e)
            }
        }
    }

    /// Drops every cache entry and forgets in-flight fetches. Open query
    /// streams end. Credentials are kept.
    pub fn shutdown(&self) {
        self.inner.in_flight.clear();
        self.inner.cache.clear();
        tracing::debug!("api client shut down");
    }

    /// Persists a whitelisted slice of application state. Without a state
    /// store this does nothing.
    ///
    /// # Errors
    ///
    /// Storage failures and slices missing from the whitelist.
    pub fn persist_slice<S: Serialize>(&self, slice: &str, value: &S) -> Result<(), PersistError> {
        match &self.inner.persistor {
            Some(persistor) => persistor.save_slice(slice, value),
            None => Ok(()),
        }
    }

    /// Restores a persisted slice, if any.
    ///
    /// # Errors
    ///
    /// Storage failures and slices that no longer decode.
    pub fn restore_slice<S: DeserializeOwned>(&self, slice: &str) -> Result<Option<S>, PersistError> {
        match &self.inner.persistor {
            Some(persistor) => persistor.load_slice(slice),
            None => Ok(None),
        }
    }

    fn end_session(&self) {
        self.inner.tokens.clear();
        if let Some(persistor) = &self.inner.persistor
            && let Err(e) = persistor.purge()
        {
            tracing::warn!(error = %e, "failed to purge persisted state");
        }
        self.inner.in_flight.clear();
        self.inner.cache.clear();
        self.inner.tokens.notify(SessionEvent::LoggedOut);
    }

    fn purge(&self, tags: &[Tag]) -> PurgeOutcome {
        if tags.is_empty() {
            return PurgeOutcome::default();
        }
        // Pending entries carry no tags yet, so the check happens when their
        // response arrives.
        for mut record in self.inner.in_flight.iter_mut() {
            record.invalidated.extend_from_slice(tags);
        }
        let outcome = self.inner.cache.purge_by_tags(tags);
        for key in &outcome.evicted {
            if let Some(mut record) = self.inner.in_flight.get_mut(key) {
                record.rerun = true;
            }
        }
        outcome
    }

    fn key_for<P: Serialize>(endpoint: &'static str, params: &P) -> Result<CacheKey, ApiError> {
        Ok(CacheKey::new(endpoint, serialize_params(params)?))
    }

    fn refetch_hook<P, T>(&self, endpoint: &QueryEndpoint<P, T>, params: Arc<P>, key: CacheKey) -> Refetch
    where
        P: Send + Sync + 'static,
        T: DeserializeOwned + Send + Sync + 'static,
    {
        // The cache owns the hook, so it must not keep the client alive.
        let client: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let endpoint = endpoint.clone();
        Arc::new(move || {
            if let Some(inner) = client.upgrade() {
                let client = Self { inner };
                drop(client.fetch_shared(&endpoint, params.clone(), key.clone(), true));
            }
        })
    }

    /// Joins the fetch in flight for `key`, or starts one.
    ///
    /// With `force`, a running fetch is asked to request once more after its
    /// current response instead of starting a second request.
    fn fetch_shared<P, T>(
        &self,
        endpoint: &QueryEndpoint<P, T>,
        params: Arc<P>,
        key: CacheKey,
        force: bool,
    ) -> SharedFetch
    where
        P: Send + Sync + 'static,
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let started = match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if force {
                    tracing::debug!(%key, "refetch queued behind in-flight fetch");
                    entry.get_mut().rerun = true;
                } else {
                    tracing::debug!(%key, "joining in-flight fetch");
                }
                return entry.get().fetch.clone();
            }
            Entry::Vacant(entry) => {
                let id = self.inner.next_fetch.fetch_add(1, Ordering::Relaxed);
                let fetch = Self::run_fetch(
                    self.inner.clone(),
                    endpoint.clone(),
                    params,
                    key.clone(),
                    id,
                )
                .boxed()
                .shared();
                entry.insert(InFlight::new(id, fetch.clone()));
                fetch
            }
        };

        tracing::debug!(%key, force, "starting fetch");
        self.inner.cache.set_fetching(key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(started.clone());
            }
            Err(_) => tracing::warn!("no tokio runtime; fetch runs only when awaited"),
        }
        started
    }

    async fn run_fetch<P, T>(
        inner: Arc<ClientInner>,
        endpoint: QueryEndpoint<P, T>,
        params: Arc<P>,
        key: CacheKey,
        fetch_id: u64,
    ) -> Result<Erased, ApiError>
    where
        P: Send + Sync + 'static,
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let spec = endpoint.build_request(&params);
        loop {
            let result = match inner.reauth.execute(&spec).await {
                Ok(response) => envelope::decode::<T>(&response),
                Err(e) => Err(e),
            };
            let result = result.map(|value| {
                let tags = endpoint.provided_tags(&value, &params);
                (Arc::new(value) as Erased, tags)
            });

            // Only the fetch that still owns the key writes, so a fetch that
            // outlived a logout cannot overwrite newer state.
            let again = match inner.in_flight.entry(key.clone()) {
                Entry::Occupied(mut entry) if entry.get().id == fetch_id => {
                    let record = entry.get_mut();
                    let outdated = match &result {
                        Ok((_, tags)) => record.is_outdated_by(tags),
                        Err(_) => record.rerun,
                    };
                    if outdated {
                        record.rerun = false;
                        record.invalidated.clear();
                        true
                    } else {
                        match &result {
                            Ok((value, tags)) => {
                                inner.cache.put(key.clone(), value.clone(), tags.iter().cloned());
                            }
                            Err(error) => inner.cache.record_error(key.clone(), error.clone()),
                        }
                        entry.remove();
                        false
                    }
                }
                _ => {
                    tracing::debug!(%key, "discarding result of abandoned fetch");
                    false
                }
            };
            if !again {
                return result.map(|(value, _)| value);
            }
            tracing::debug!(%key, "invalidated while in flight, fetching again");
        }
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.inner.config.base_url)
            .field("cache", &self.inner.cache)
            .field("tokens", &self.inner.tokens)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ApiClient`].
#[derive(Default)]
pub struct ApiClientBuilder {
    config: Option<ClientConfig>,
    transport: Option<Arc<dyn Transport>>,
    state_store: Option<Arc<dyn StateStore>>,
    persist_slices: Vec<String>,
}

impl ApiClientBuilder {
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Uses `transport` instead of the default HTTP transport.
    #[must_use]
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Persists credentials (and whitelisted slices) into `store`.
    #[must_use]
    pub fn state_store(mut self, store: impl StateStore + 'static) -> Self {
        self.state_store = Some(Arc::new(store));
        self
    }

    /// Allows [`ApiClient::persist_slice`] for `slice`.
    #[must_use]
    pub fn persist_slice(mut self, slice: impl Into<String>) -> Self {
        self.persist_slices.push(slice.into());
        self
    }

    /// # Errors
    ///
    /// Fails if no transport is given and the default one cannot be created.
    pub fn build(self) -> Result<ApiClient, ConfigError> {
        let config = self.config.unwrap_or_default();
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport(&config)?,
        };

        let persistor = self
            .state_store
            .map(|store| Persistor::new(store, &config.persist_namespace, self.persist_slices));
        let tokens = match &persistor {
            Some(persistor) => TokenStore::with_persistor(persistor.clone()),
            None => TokenStore::new(),
        };
        let reauth = ReauthPolicy::new(
            transport,
            tokens.clone(),
            config.base_url.clone(),
            config.refresh_path.clone(),
            config.csrf_header.clone(),
        );
        let cache = Cache::new(config.query.keep_unused_for);

        tracing::debug!(base_url = %config.base_url, "api client created");
        Ok(ApiClient {
            inner: Arc::new(ClientInner {
                config,
                reauth,
                tokens,
                cache,
                in_flight: DashMap::new(),
                next_fetch: AtomicU64::new(0),
                persistor,
            }),
        })
    }
}

#[cfg(feature = "http")]
fn default_transport(config: &ClientConfig) -> Result<Arc<dyn Transport>, ConfigError> {
    Ok(Arc::new(crate::transport::HttpTransport::new(config.timeout)?))
}

#[cfg(not(feature = "http"))]
fn default_transport(_config: &ClientConfig) -> Result<Arc<dyn Transport>, ConfigError> {
    Err(ConfigError::MissingTransport)
}
