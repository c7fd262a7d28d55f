//! Endpoint descriptors, request specs and invalidation tags.
//!
//! An endpoint is declared once and never mutated. Queries describe what they
//! *provide* (tags attached to the cached result); mutations describe what they
//! *invalidate* (tags whose cached results must be refetched after a write).
//!
//! # Example
//!
//! ```
//! use kinder_client::endpoint::{MutationEndpoint, QueryEndpoint, RequestSpec, Tag};
//!
//! let school = QueryEndpoint::<u64, serde_json::Value>::new("school", |id| {
//!     RequestSpec::get(format!("/schools/{id}"))
//! })
//! .provides(|_school, id| vec![Tag::with_id("School", id)]);
//!
//! let publish = MutationEndpoint::<u64, serde_json::Value>::new("publishSchool", |id| {
//!     RequestSpec::post(format!("/schools/{id}/publish"))
//! })
//! .invalidates(|id, _result| vec![Tag::with_id("School", id)]);
//!
//! assert_eq!(school.id(), "school");
//! assert_eq!(publish.invalidated_tags(&42, &serde_json::Value::Null)[0].to_string(), "School:42");
//! ```

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::ApiError;
use crate::session::CredentialPair;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-independent description of a request, relative to the API base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    /// JSON body. `Err` keeps a serialization failure; sending such a request
    /// fails with [`ApiError::Serialize`] before anything reaches the network.
    pub body: Option<Result<serde_json::Value, String>>,
    /// Never attempt a credential refresh for this request (login, refresh, logout).
    pub skip_reauth: bool,
}

impl RequestSpec {
    /// Creates a request with the given method and path.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            skip_reauth: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Appends a query-string parameter.
    #[must_use]
    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    /// Appends a query-string parameter when `value` is present.
    #[must_use]
    pub fn query_opt(self, name: impl Into<String>, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.query(name, value),
            None => self,
        }
    }

    /// Sets a JSON body.
    #[must_use]
    pub fn json(mut self, body: &impl Serialize) -> Self {
        self.body = Some(serde_json::to_value(body).map_err(|e| e.to_string()));
        self
    }

    #[must_use]
    pub const fn skip_reauth(mut self) -> Self {
        self.skip_reauth = true;
        self
    }
}

/// A label describing what kind of data a cached result is.
///
/// Rendered as `Kind` or `Kind:id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    kind: Cow<'static, str>,
    id: Option<String>,
}

impl Tag {
    /// A tag covering every entity of a kind.
    pub fn new(kind: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
        }
    }

    /// A tag for a single entity (or a named collection such as `LIST`).
    pub fn with_id(kind: impl Into<Cow<'static, str>>, id: impl ToString) -> Self {
        Self {
            kind: kind.into(),
            id: Some(id.to_string()),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Returns `true` if invalidating `self` affects data that provides `provided`.
    ///
    /// A tag without an id matches every tag of the same kind.
    pub fn matches(&self, provided: &Self) -> bool {
        self.kind == provided.kind && (self.id.is_none() || self.id == provided.id)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{id}", self.kind),
            None => f.write_str(&self.kind),
        }
    }
}

type RequestFn<P> = Arc<dyn Fn(&P) -> RequestSpec + Send + Sync>;
type ProvidesFn<P, T> = Arc<dyn Fn(&T, &P) -> Vec<Tag> + Send + Sync>;
type InvalidatesFn<P, T> = Arc<dyn Fn(&P, &T) -> Vec<Tag> + Send + Sync>;

/// A read endpoint whose results are cached under the tags it provides.
pub struct QueryEndpoint<P, T> {
    id: &'static str,
    request: RequestFn<P>,
    provides: ProvidesFn<P, T>,
}

impl<P: 'static, T: 'static> QueryEndpoint<P, T> {
    /// Creates a query endpoint that provides no tags.
    pub fn new<F>(id: &'static str, request: F) -> Self
    where
        F: Fn(&P) -> RequestSpec + Send + Sync + 'static,
    {
        Self {
            id,
            request: Arc::new(request),
            provides: Arc::new(|_, _| Vec::new()),
        }
    }

    /// Sets the provider-tag producer.
    #[must_use]
    pub fn provides<F>(mut self, provides: F) -> Self
    where
        F: Fn(&T, &P) -> Vec<Tag> + Send + Sync + 'static,
    {
        self.provides = Arc::new(provides);
        self
    }

    pub const fn id(&self) -> &'static str {
        self.id
    }

    pub fn build_request(&self, params: &P) -> RequestSpec {
        (self.request)(params)
    }

    pub fn provided_tags(&self, result: &T, params: &P) -> Vec<Tag> {
        (self.provides)(result, params)
    }
}

impl<P, T> Clone for QueryEndpoint<P, T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            request: self.request.clone(),
            provides: self.provides.clone(),
        }
    }
}

impl<P, T> fmt::Debug for QueryEndpoint<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEndpoint")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// What a successful mutation does to the session.
pub enum SessionEffect<T> {
    /// Leaves the credentials alone.
    None,
    /// Stores the credentials extracted from the result (login).
    Establish(Arc<dyn Fn(&T) -> CredentialPair + Send + Sync>),
    /// Clears credentials, persisted state and the cache (logout).
    Clear,
}

impl<T> Clone for SessionEffect<T> {
    fn clone(&self) -> Self {
        match self {
            Self::None => Self::None,
            Self::Establish(f) => Self::Establish(f.clone()),
            Self::Clear => Self::Clear,
        }
    }
}

impl<T> fmt::Debug for SessionEffect<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Establish(_) => f.write_str("Establish"),
            Self::Clear => f.write_str("Clear"),
        }
    }
}

/// A write endpoint that invalidates tags on success.
pub struct MutationEndpoint<P, T> {
    id: &'static str,
    request: RequestFn<P>,
    invalidates: InvalidatesFn<P, T>,
    session: SessionEffect<T>,
}

impl<P: 'static, T: 'static> MutationEndpoint<P, T> {
    /// Creates a mutation endpoint that invalidates nothing.
    pub fn new<F>(id: &'static str, request: F) -> Self
    where
        F: Fn(&P) -> RequestSpec + Send + Sync + 'static,
    {
        Self {
            id,
            request: Arc::new(request),
            invalidates: Arc::new(|_, _| Vec::new()),
            session: SessionEffect::None,
        }
    }

    /// Sets the invalidation-tag producer.
    #[must_use]
    pub fn invalidates<F>(mut self, invalidates: F) -> Self
    where
        F: Fn(&P, &T) -> Vec<Tag> + Send + Sync + 'static,
    {
        self.invalidates = Arc::new(invalidates);
        self
    }

    /// Marks this mutation as establishing a session from its result.
    #[must_use]
    pub fn establishes_session<F>(mut self, credentials: F) -> Self
    where
        F: Fn(&T) -> CredentialPair + Send + Sync + 'static,
    {
        self.session = SessionEffect::Establish(Arc::new(credentials));
        self
    }

    /// Marks this mutation as ending the session.
    #[must_use]
    pub fn clears_session(mut self) -> Self {
        self.session = SessionEffect::Clear;
        self
    }

    pub const fn id(&self) -> &'static str {
        self.id
    }

    pub fn build_request(&self, params: &P) -> RequestSpec {
        (self.request)(params)
    }

    pub fn invalidated_tags(&self, params: &P, result: &T) -> Vec<Tag> {
        (self.invalidates)(params, result)
    }

    pub const fn session_effect(&self) -> &SessionEffect<T> {
        &self.session
    }
}

impl<P, T> Clone for MutationEndpoint<P, T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            request: self.request.clone(),
            invalidates: self.invalidates.clone(),
            session: self.session.clone(),
        }
    }
}

impl<P, T> fmt::Debug for MutationEndpoint<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationEndpoint")
            .field("id", &self.id)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Serializes endpoint parameters into the stable string used in cache keys.
pub(crate) fn serialize_params<P: Serialize>(params: &P) -> Result<String, ApiError> {
    serde_json::to_string(params).map_err(|e| ApiError::Serialize(e.to_string()))
}
