//! Scripted transport for testing.
//!
//! [`MockTransport`] answers requests from registered routes and records every
//! call, enabling deterministic tests of the reauth and cache layers without a
//! server.
//!
//! # Basic Usage
//!
//! ```
//! use kinder_client::endpoint::Method;
//! use kinder_client::transport::mock::MockTransport;
//! use serde_json::json;
//!
//! let mock = MockTransport::new();
//! mock.on_json(Method::Get, "/schools/42", 200, json!({"data": {"id": 42}}));
//!
//! assert_eq!(mock.call_count(Method::Get, "/schools/42"), 0);
//! ```
//!
//! Clones share routes and the call log, so a test can keep one handle while
//! the client owns another.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;

use super::{HttpRequest, HttpResponse, Transport, TransportError};
use crate::endpoint::Method;

type Responder = Arc<dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync>;

struct Route {
    method: Method,
    path: String,
    delay: Option<Duration>,
    responder: Responder,
}

#[derive(Default)]
struct Inner {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<HttpRequest>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

// Counts a call as on the wire until dropped.
struct Outstanding<'a>(&'a Inner);

impl<'a> Outstanding<'a> {
    fn start(inner: &'a Inner) -> Self {
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak.fetch_max(now, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for Outstanding<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A transport that answers from registered routes.
///
/// Routes match on method and URL path (query string ignored). The most
/// recently registered matching route wins; unmatched requests get a 404
/// error envelope. The response is decided when the request is sent and
/// delivered after the route's delay, or the global one.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every response, so concurrent callers overlap.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.inner.delay) = delay;
    }

    /// Registers a route answered by `responder`.
    pub fn on<F>(&self, method: Method, path: &str, responder: F)
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        self.route(method, path, None, Arc::new(responder));
    }

    /// Like [`on`](Self::on), answering after `delay`.
    pub fn on_delayed<F>(&self, method: Method, path: &str, delay: Duration, responder: F)
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        self.route(method, path, Some(delay), Arc::new(responder));
    }

    fn route(&self, method: Method, path: &str, delay: Option<Duration>, responder: Responder) {
        lock(&self.inner.routes).push(Route {
            method,
            path: path.to_string(),
            delay,
            responder,
        });
    }

    /// Registers a route that always answers with the same JSON body.
    pub fn on_json(&self, method: Method, path: &str, status: u16, body: serde_json::Value) {
        self.on(method, path, move |_| Ok(HttpResponse::json(status, &body)));
    }

    /// Registers a route that answers from `responses` in order, repeating the
    /// last one once the sequence is exhausted.
    pub fn on_sequence(
        &self,
        method: Method,
        path: &str,
        responses: Vec<Result<HttpResponse, TransportError>>,
    ) {
        let queue = Mutex::new(VecDeque::from(responses));
        self.on(method, path, move |_| {
            let mut queue = lock(&queue);
            let next = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            next.unwrap_or_else(|| Err(TransportError::Network("sequence is empty".to_string())))
        });
    }

    /// Every request sent so far, in order.
    pub fn calls(&self) -> Vec<HttpRequest> {
        lock(&self.inner.calls).clone()
    }

    /// Number of requests sent to `method` `path`.
    pub fn call_count(&self, method: Method, path: &str) -> usize {
        lock(&self.inner.calls)
            .iter()
            .filter(|call| call.method == method && url_path(&call.url) == path)
            .count()
    }

    /// Requests sent to `method` `path`.
    pub fn calls_to(&self, method: Method, path: &str) -> Vec<HttpRequest> {
        lock(&self.inner.calls)
            .iter()
            .filter(|call| call.method == method && url_path(&call.url) == path)
            .cloned()
            .collect()
    }

    pub fn reset_calls(&self) {
        lock(&self.inner.calls).clear();
    }

    /// Highest number of requests that were awaiting their response at once.
    pub fn max_concurrent_calls(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    fn respond(&self, request: &HttpRequest) -> (Duration, Result<HttpResponse, TransportError>) {
        let path = url_path(&request.url);
        let route = lock(&self.inner.routes)
            .iter()
            .rev()
            .find(|route| route.method == request.method && route.path == path)
            .map(|route| (route.delay, route.responder.clone()));
        let delay = route
            .as_ref()
            .and_then(|(delay, _)| *delay)
            .unwrap_or_else(|| *lock(&self.inner.delay));

        let response = match route {
            Some((_, responder)) => responder(request),
            None => Ok(HttpResponse::json(
                404,
                &serde_json::json!({
                    "error": {"code": "NOT_FOUND", "message": format!("no mock route for {path}")}
                }),
            )),
        };
        (delay, response)
    }
}

impl Transport for MockTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
        Box::pin(async move {
            let _outstanding = Outstanding::start(&self.inner);
            lock(&self.inner.calls).push(request.clone());
            let (delay, response) = self.respond(&request);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            response
        })
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("routes", &lock(&self.inner.routes).len())
            .field("calls", &lock(&self.inner.calls).len())
            .finish()
    }
}

/// Extracts the path component of an absolute URL.
fn url_path(url: &str) -> &str {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path = without_scheme
        .find('/')
        .map_or("/", |i| &without_scheme[i..]);
    path.split_once('?').map_or(path, |(path, _)| path)
}
