use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::endpoint::Tag;
use crate::error::ApiError;

/// A type-erased cached value. Endpoints know the concrete type.
pub type Erased = Arc<dyn Any + Send + Sync>;

/// Coarse status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Success,
    Error,
}

/// A cached entry with timestamp and staleness information.
///
/// This is what subscribers observe: every change is published as a fresh
/// clone over the entry's watch channel.
#[derive(Clone)]
pub struct CacheEntry {
    /// The last successful value. A failed refetch leaves it in place.
    pub data: Option<Erased>,
    /// The error of the last attempt, cleared by the next success.
    pub error: Option<ApiError>,
    /// Tags provided by the last successful value.
    pub tags: HashSet<Tag>,
    /// When the last successful value was stored.
    pub timestamp: Option<Instant>,
    pub is_stale: bool,
    pub is_fetching: bool,
}

impl CacheEntry {
    /// Creates an empty entry that has never been fetched.
    pub fn new() -> Self {
        Self {
            data: None,
            error: None,
            tags: HashSet::new(),
            timestamp: None,
            is_stale: false,
            is_fetching: false,
        }
    }

    pub fn status(&self) -> EntryStatus {
        if self.error.is_some() && !self.is_fetching {
            EntryStatus::Error
        } else if self.data.is_some() {
            EntryStatus::Success
        } else {
            EntryStatus::Pending
        }
    }

    /// Checks if this entry is stale based on the given stale time.
    pub fn check_staleness(&mut self, stale_time: Duration) -> bool {
        if self
            .timestamp
            .is_some_and(|timestamp| timestamp.elapsed() > stale_time)
        {
            self.is_stale = true;
        }
        self.is_stale
    }

    /// Returns `true` if a subscriber arriving now should trigger a fetch.
    pub fn needs_fetch(&self, stale_time: Duration) -> bool {
        self.data.is_none() || self.clone().check_staleness(stale_time)
    }

    /// Marks this entry as stale.
    pub fn mark_stale(&mut self) {
        self.is_stale = true;
    }

    /// Updates the entry with new data, replacing the tag set and resetting
    /// timestamp, staleness and error.
    pub fn update(&mut self, data: Erased, tags: impl IntoIterator<Item = Tag>) {
        self.data = Some(data);
        self.tags = tags.into_iter().collect();
        self.error = None;
        self.timestamp = Some(Instant::now());
        self.is_stale = false;
        self.is_fetching = false;
    }

    /// Records a failed attempt. Data and tags are kept.
    pub fn record_error(&mut self, error: ApiError) {
        self.error = Some(error);
        self.is_fetching = false;
    }

    /// Returns `true` if any of `invalidated` covers a tag of this entry.
    pub fn is_invalidated_by(&self, invalidated: &[Tag]) -> bool {
        invalidated
            .iter()
            .any(|tag| self.tags.iter().any(|provided| tag.matches(provided)))
    }

    /// Downcasts the cached value.
    pub fn data_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.data.as_ref().and_then(|data| data.downcast_ref::<T>())
    }
}

impl Default for CacheEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("status", &self.status())
            .field("error", &self.error)
            .field("tags", &self.tags)
            .field("timestamp", &self.timestamp)
            .field("is_stale", &self.is_stale)
            .field("is_fetching", &self.is_fetching)
            .finish_non_exhaustive()
    }
}
