//! Query results as observed by a subscriber.
//!
//! A [`QueryStream`] yields a [`QueryResult`] immediately on subscription and
//! again on every change of the underlying cache entry:
//!
//! 1. A new key starts out [`QueryState::Pending`] while the first fetch runs.
//! 2. A cached key yields its current state at once.
//! 3. When the entry is invalidated, the stream yields the cached value with
//!    `is_stale` set, followed by the refetched value.
//!
//! The stream ends when the client drops the entry (logout, shutdown).
//! Dropping the stream releases the subscription.

use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_stream::wrappers::WatchStream;

use crate::cache::{CacheEntry, CacheKey, EntryStatus, Subscription};
use crate::error::ApiError;

/// The state of a query result.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<T> {
    /// No value yet; the first fetch is in flight.
    Pending,
    /// Query succeeded with data.
    Success {
        /// The data returned by the query.
        data: T,
        /// Whether the data has been invalidated or outlived the stale time.
        is_stale: bool,
    },
    /// The last fetch failed.
    Error {
        error: ApiError,
        /// The last successful value, if any.
        data: Option<T>,
    },
}

/// A query result containing the current state.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
    /// The current state of the query.
    pub state: QueryState<T>,
    /// Whether a fetch for this key is in flight.
    pub is_fetching: bool,
}

impl<T> QueryResult<T> {
    /// Returns the data if any value is available, including the value kept
    /// from before a failed refetch.
    pub const fn data(&self) -> Option<&T> {
        match &self.state {
            QueryState::Success { data, .. } => Some(data),
            QueryState::Error { data, .. } => data.as_ref(),
            QueryState::Pending => None,
        }
    }

    /// Returns the error of the last fetch, if it failed.
    pub const fn error(&self) -> Option<&ApiError> {
        match &self.state {
            QueryState::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Returns `true` if no value has arrived yet.
    pub const fn is_pending(&self) -> bool {
        matches!(self.state, QueryState::Pending)
    }

    /// Returns `true` if the query succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self.state, QueryState::Success { .. })
    }

    /// Returns `true` if the query failed.
    pub const fn is_error(&self) -> bool {
        matches!(self.state, QueryState::Error { .. })
    }

    /// Returns `true` if the query data is stale.
    pub const fn is_stale(&self) -> bool {
        matches!(self.state, QueryState::Success { is_stale: true, .. })
    }
}

impl<T: Clone + Send + Sync + 'static> QueryResult<T> {
    /// Builds a typed result from a cache entry.
    ///
    /// A value of the wrong type is reported as a decode error; it means two
    /// endpoints share an id.
    pub(crate) fn from_entry(entry: &CacheEntry) -> Self {
        let data = entry.data_as::<T>().cloned();
        let state = match (entry.status(), &entry.error, data) {
            (EntryStatus::Error, Some(error), data) => QueryState::Error {
                error: error.clone(),
                data,
            },
            (EntryStatus::Pending, ..) => QueryState::Pending,
            (_, _, Some(data)) => QueryState::Success {
                data,
                is_stale: entry.is_stale,
            },
            (_, _, None) => QueryState::Error {
                error: ApiError::Decode("cached value has an unexpected type".to_string()),
                data: None,
            },
        };
        Self {
            state,
            is_fetching: entry.is_fetching,
        }
    }

    pub(crate) fn failed(error: ApiError) -> Self {
        Self {
            state: QueryState::Error { error, data: None },
            is_fetching: false,
        }
    }
}

/// Stream of [`QueryResult`]s for one cache entry.
pub struct QueryStream<T> {
    key: Option<CacheKey>,
    inner: BoxStream<'static, QueryResult<T>>,
    // Held for its Drop.
    _subscription: Option<Subscription>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + Send + Sync + 'static> QueryStream<T> {
    pub(crate) fn new(subscription: Subscription) -> Self {
        let key = subscription.key().clone();
        let inner = WatchStream::new(subscription.watch())
            .map(|entry| QueryResult::from_entry(&entry))
            .boxed();
        Self {
            key: Some(key),
            inner,
            _subscription: Some(subscription),
            _marker: PhantomData,
        }
    }

    /// A stream that yields a single error and ends.
    pub(crate) fn failed(error: ApiError) -> Self {
        Self {
            key: None,
            inner: stream::once(async move { QueryResult::failed(error) }).boxed(),
            _subscription: None,
            _marker: PhantomData,
        }
    }
}

impl<T> QueryStream<T> {
    /// The cache key this stream observes. `None` for a stream that failed
    /// before subscribing.
    pub fn key(&self) -> Option<&CacheKey> {
        self.key.as_ref()
    }

    /// Waits for the first result that is neither pending nor fetching.
    ///
    /// Returns `None` if the stream ends first.
    pub async fn settled(&mut self) -> Option<QueryResult<T>> {
        while let Some(result) = self.inner.next().await {
            if !result.is_pending() && !result.is_fetching {
                return Some(result);
            }
        }
        None
    }
}

impl<T> Stream for QueryStream<T> {
    type Item = QueryResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<T> std::fmt::Debug for QueryStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryStream")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn success(data: i32, is_stale: bool) -> QueryResult<i32> {
        QueryResult {
            state: QueryState::Success { data, is_stale },
            is_fetching: false,
        }
    }

    #[test]
    fn test_query_result_data() {
        assert_eq!(success(42, false).data(), Some(&42));

        let result: QueryResult<i32> = QueryResult {
            state: QueryState::Pending,
            is_fetching: true,
        };
        assert_eq!(result.data(), None);

        let result = QueryResult {
            state: QueryState::Error {
                error: ApiError::Network("down".to_string()),
                data: Some(7),
            },
            is_fetching: false,
        };
        assert_eq!(result.data(), Some(&7));
        assert!(result.error().is_some());
    }

    #[test]
    fn test_query_result_predicates() {
        let pending: QueryResult<i32> = QueryResult {
            state: QueryState::Pending,
            is_fetching: true,
        };
        assert!(pending.is_pending());
        assert!(!pending.is_success());
        assert!(!pending.is_error());
        assert!(!pending.is_stale());

        let fresh = success(42, false);
        assert!(fresh.is_success());
        assert!(!fresh.is_stale());

        let stale = success(42, true);
        assert!(stale.is_success());
        assert!(stale.is_stale());

        let error: QueryResult<i32> = QueryResult::failed(ApiError::Unauthenticated);
        assert!(error.is_error());
        assert!(!error.is_pending());
    }

    #[test]
    fn test_from_entry() {
        let mut entry = CacheEntry::new();
        entry.is_fetching = true;
        let result = QueryResult::<i32>::from_entry(&entry);
        assert!(result.is_pending());
        assert!(result.is_fetching);

        entry.update(Arc::new(5_i32), []);
        assert_eq!(QueryResult::<i32>::from_entry(&entry), success(5, false));

        entry.mark_stale();
        assert!(QueryResult::<i32>::from_entry(&entry).is_stale());

        let wrong_type = QueryResult::<String>::from_entry(&entry);
        assert!(matches!(
            wrong_type.error(),
            Some(ApiError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_yields_current_then_updates() {
        let cache = crate::cache::Cache::new(Duration::from_secs(60));
        let key = CacheKey::new("count", "null");
        cache.put(key.clone(), Arc::new(1_i32), []);

        let mut stream = QueryStream::<i32>::new(cache.subscribe(key.clone()));
        assert_eq!(stream.key(), Some(&key));
        let first = stream.next().await.expect("current state");
        assert_eq!(first.data(), Some(&1));

        cache.put(key.clone(), Arc::new(2_i32), []);
        let second = stream.next().await.expect("update");
        assert_eq!(second.data(), Some(&2));

        drop(stream);
        assert_eq!(cache.subscriber_count(&key), 0);
    }

    #[tokio::test]
    async fn test_failed_stream() {
        let mut stream = QueryStream::<i32>::failed(ApiError::Serialize("bad".to_string()));
        assert!(stream.key().is_none());
        let result = stream.next().await.expect("one item");
        assert!(result.is_error());
        assert!(stream.next().await.is_none());
    }
}
