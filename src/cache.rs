//! Keyed result cache with tag-based invalidation.
//!
//! Each entry lives behind a [`tokio::sync::watch`] channel: subscribers see
//! the current [`CacheEntry`] immediately and every later change. Entries
//! carry the tags their last successful value provided;
//! [`Cache::purge_by_tags`] refetches subscribed entries whose tags match and
//! evicts unsubscribed ones.
//!
//! # Lifetime
//!
//! An entry lives as long as it has subscribers. When the last
//! [`Subscription`] is dropped the entry is kept for
//! [`QueryConfig::keep_unused_for`](crate::config::QueryConfig::keep_unused_for)
//! and evicted afterwards, unless someone subscribes again first.

pub mod entry;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::endpoint::Tag;
use crate::error::ApiError;

pub use self::entry::{CacheEntry, EntryStatus, Erased};

/// Identifies a cache entry: endpoint id plus serialized parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    endpoint: &'static str,
    params: String,
}

impl CacheKey {
    pub fn new(endpoint: &'static str, params: impl Into<String>) -> Self {
        Self {
            endpoint,
            params: params.into(),
        }
    }

    pub const fn endpoint(&self) -> &'static str {
        self.endpoint
    }

    pub fn params(&self) -> &str {
        &self.params
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.endpoint, self.params)
    }
}

/// Hook that re-runs the fetch of an entry. Must not block.
pub type Refetch = Arc<dyn Fn() + Send + Sync>;

struct Slot {
    // Distinguishes a re-created entry from an evicted one with the same key.
    id: u64,
    state: watch::Sender<CacheEntry>,
    subscribers: usize,
    refetch: Option<Refetch>,
    eviction: Option<CancellationToken>,
}

impl Slot {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: watch::Sender::new(CacheEntry::new()),
            subscribers: 0,
            refetch: None,
            eviction: None,
        }
    }

    fn cancel_eviction(&mut self) {
        if let Some(token) = self.eviction.take() {
            token.cancel();
        }
    }
}

struct CacheInner {
    slots: DashMap<CacheKey, Slot>,
    next_id: AtomicU64,
    keep_unused_for: Duration,
}

/// Entries affected by a [`Cache::purge_by_tags`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    /// Subscribed entries whose refetch was triggered.
    pub refetched: Vec<CacheKey>,
    /// Subscribed entries marked stale that have no refetch hook.
    pub marked_stale: Vec<CacheKey>,
    /// Unsubscribed entries that were evicted.
    pub evicted: Vec<CacheKey>,
}

impl PurgeOutcome {
    pub fn is_empty(&self) -> bool {
        self.refetched.is_empty() && self.marked_stale.is_empty() && self.evicted.is_empty()
    }
}

/// Shared, cloneable cache.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    /// Creates a cache that keeps unused entries for `keep_unused_for`.
    pub fn new(keep_unused_for: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                slots: DashMap::new(),
                next_id: AtomicU64::new(0),
                keep_unused_for,
            }),
        }
    }

    /// Returns a snapshot of the entry under `key`.
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner
            .slots
            .get(key)
            .map(|slot| slot.state.borrow().clone())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.inner.slots.iter().map(|slot| slot.key().clone()).collect()
    }

    /// Number of live subscriptions on `key`.
    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.inner.slots.get(key).map_or(0, |slot| slot.subscribers)
    }

    /// Stores a successful value and its tags, replacing both, and notifies
    /// subscribers.
    pub fn put(&self, key: CacheKey, value: Erased, tags: impl IntoIterator<Item = Tag>) {
        let tags: Vec<Tag> = tags.into_iter().collect();
        tracing::debug!(%key, tags = tags.len(), "cache put");
        self.modify(key, |entry| entry.update(value, tags));
    }

    /// Records a failed fetch without touching the cached value or tags.
    pub fn record_error(&self, key: CacheKey, error: ApiError) {
        tracing::debug!(%key, %error, "cache fetch failed");
        self.modify(key, |entry| entry.record_error(error));
    }

    /// Flags the entry as having a fetch in flight.
    pub fn set_fetching(&self, key: CacheKey) {
        self.modify(key, |entry| entry.is_fetching = true);
    }

    fn modify(&self, key: CacheKey, f: impl FnOnce(&mut CacheEntry)) {
        let schedule = {
            let id = self.next_id();
            let mut slot = self.inner.slots.entry(key.clone()).or_insert_with(|| Slot::new(id));
            slot.state.send_modify(f);
            // Results written without a subscriber must still age out.
            (slot.subscribers == 0 && slot.eviction.is_none()).then(|| {
                let token = CancellationToken::new();
                slot.eviction = Some(token.clone());
                (slot.id, token)
            })
        };
        if let Some((id, token)) = schedule {
            self.schedule_eviction(key, id, token);
        }
    }

    /// Installs the refetch hook of `key` unless one is already present.
    pub fn set_refetch_if_absent(&self, key: CacheKey, refetch: impl FnOnce() -> Refetch) {
        let id = self.next_id();
        let mut slot = self.inner.slots.entry(key).or_insert_with(|| Slot::new(id));
        if slot.refetch.is_none() {
            slot.refetch = Some(refetch());
        }
    }

    /// Subscribes to `key`, creating an empty entry if needed.
    ///
    /// A pending eviction of the entry is cancelled.
    pub fn subscribe(&self, key: CacheKey) -> Subscription {
        let id = self.next_id();
        let mut slot = self
            .inner
            .slots
            .entry(key.clone())
            .or_insert_with(|| Slot::new(id));
        slot.subscribers += 1;
        slot.cancel_eviction();
        tracing::trace!(%key, subscribers = slot.subscribers, "cache subscribe");

        Subscription {
            key,
            slot_id: slot.id,
            receiver: slot.state.subscribe(),
            cache: Arc::downgrade(&self.inner),
        }
    }

    /// Releases a subscription. Equivalent to dropping it.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Invalidates every entry whose provider tags match any of `tags`.
    ///
    /// Which entries are affected is decided synchronously. Subscribed
    /// entries are marked stale and their refetch hooks run (hooks only spawn
    /// work); unsubscribed entries are evicted immediately. Tags that match
    /// nothing make this a no-op.
    pub fn purge_by_tags(&self, tags: &[Tag]) -> PurgeOutcome {
        let mut outcome = PurgeOutcome::default();
        if tags.is_empty() {
            return outcome;
        }

        let matching: Vec<CacheKey> = self
            .inner
            .slots
            .iter()
            .filter(|slot| slot.state.borrow().is_invalidated_by(tags))
            .map(|slot| slot.key().clone())
            .collect();

        let mut hooks = Vec::new();
        for key in matching {
            if let Some((_, mut slot)) = self
                .inner
                .slots
                .remove_if(&key, |_, slot| slot.subscribers == 0)
            {
                slot.cancel_eviction();
                outcome.evicted.push(key);
                continue;
            }
            if let Some(slot) = self.inner.slots.get(&key) {
                slot.state.send_modify(CacheEntry::mark_stale);
                match &slot.refetch {
                    Some(refetch) => {
                        hooks.push(refetch.clone());
                        outcome.refetched.push(key);
                    }
                    None => outcome.marked_stale.push(key),
                }
            }
        }

        if !outcome.is_empty() {
            tracing::debug!(
                tags = ?tags.iter().map(ToString::to_string).collect::<Vec<_>>(),
                refetched = outcome.refetched.len(),
                evicted = outcome.evicted.len(),
                "purged cache by tags"
            );
        }
        // Slot guards are released; hooks may touch the cache.
        for refetch in hooks {
            refetch();
        }
        outcome
    }

    /// Removes an entry regardless of subscribers. Its subscribers' streams end.
    pub fn remove(&self, key: &CacheKey) -> bool {
        match self.inner.slots.remove(key) {
            Some((_, mut slot)) => {
                slot.cancel_eviction();
                true
            }
            None => false,
        }
    }

    /// Removes every entry and cancels pending evictions.
    pub fn clear(&self) {
        let keys = self.keys();
        for key in &keys {
            self.remove(key);
        }
        tracing::debug!(removed = keys.len(), "cache cleared");
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn release(inner: &Arc<CacheInner>, key: &CacheKey, slot_id: u64) {
        let schedule = {
            let Some(mut slot) = inner.slots.get_mut(key) else {
                return;
            };
            if slot.id != slot_id {
                return;
            }
            slot.subscribers = slot.subscribers.saturating_sub(1);
            tracing::trace!(%key, subscribers = slot.subscribers, "cache unsubscribe");
            (slot.subscribers == 0).then(|| {
                slot.cancel_eviction();
                let token = CancellationToken::new();
                slot.eviction = Some(token.clone());
                token
            })
        };
        if let Some(token) = schedule {
            let cache = Self {
                inner: inner.clone(),
            };
            cache.schedule_eviction(key.clone(), slot_id, token);
        }
    }

    fn schedule_eviction(&self, key: CacheKey, slot_id: u64, token: CancellationToken) {
        let grace = self.inner.keep_unused_for;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if !grace.is_zero() => {
                let cache = Arc::downgrade(&self.inner);
                handle.spawn(async move {
                    tokio::select! {
                        () = token.cancelled() => {}
                        () = tokio::time::sleep(grace) => {
                            if let Some(inner) = cache.upgrade() {
                                Self::evict_if_unused(&inner, &key, slot_id);
                            }
                        }
                    }
                });
            }
            _ => Self::evict_if_unused(&self.inner, &key, slot_id),
        }
    }

    fn evict_if_unused(inner: &CacheInner, key: &CacheKey, slot_id: u64) {
        let evicted = inner
            .slots
            .remove_if(key, |_, slot| slot.id == slot_id && slot.subscribers == 0);
        if evicted.is_some() {
            tracing::debug!(%key, "evicted unused cache entry");
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("entries", &self.len())
            .field("keep_unused_for", &self.inner.keep_unused_for)
            .finish()
    }
}

/// A live interest in one cache entry. Dropping it releases the entry.
pub struct Subscription {
    key: CacheKey,
    slot_id: u64,
    receiver: watch::Receiver<CacheEntry>,
    cache: Weak<CacheInner>,
}

impl Subscription {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The entry as it is right now.
    pub fn current(&self) -> CacheEntry {
        self.receiver.borrow().clone()
    }

    /// A receiver of entry updates, starting from the current state.
    pub fn watch(&self) -> watch::Receiver<CacheEntry> {
        let mut receiver = self.receiver.clone();
        receiver.mark_changed();
        receiver
    }

    /// Waits for the next update. Returns `None` once the entry is removed.
    pub async fn changed(&mut self) -> Option<CacheEntry> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.cache.upgrade() {
            Cache::release(&inner, &self.key, self.slot_id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
