//! Credential storage and session notifications.
//!
//! [`TokenStore`] holds the single credential slot shared by every outgoing
//! request. Writes replace the whole [`CredentialPair`] at once, so readers
//! never observe a half-written pair.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::persist::Persistor;

/// Access token plus anti-forgery token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPair {
    pub access_token: String,
    pub csrf_token: String,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, csrf_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            csrf_token: csrf_token.into(),
        }
    }
}

// Tokens stay out of logs.
impl std::fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPair").finish_non_exhaustive()
    }
}

/// Session lifecycle notifications for external collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A login stored fresh credentials.
    Established,
    /// The reauth policy replaced expired credentials.
    Refreshed,
    /// A refresh failed; the user must log in again.
    Expired,
    /// The user logged out.
    LoggedOut,
}

/// The credential slot together with its write counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSnapshot {
    pub credentials: Option<CredentialPair>,
    /// Incremented on every `set` and `clear`.
    pub generation: u64,
}

struct Inner {
    slot: watch::Sender<CredentialSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    persistor: Option<Persistor>,
}

/// Shared, cloneable credential slot.
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<Inner>,
}

impl TokenStore {
    /// Creates an empty, non-persistent store.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// Creates a store mirrored into `persistor`, restoring any persisted pair.
    pub fn with_persistor(persistor: Persistor) -> Self {
        let restored = match persistor.load() {
            Ok(state) => state.credentials,
            Err(e) => {
                tracing::warn!(error = %e, key = persistor.key(), "ignoring unreadable persisted session");
                None
            }
        };
        if restored.is_some() {
            tracing::debug!(key = persistor.key(), "restored persisted credentials");
        }
        Self::build(restored, Some(persistor))
    }

    fn build(credentials: Option<CredentialPair>, persistor: Option<Persistor>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                slot: watch::Sender::new(CredentialSnapshot {
                    credentials,
                    generation: 0,
                }),
                events,
                persistor,
            }),
        }
    }

    /// Returns the current credentials, or `None` when unauthenticated.
    pub fn get(&self) -> Option<CredentialPair> {
        self.inner.slot.borrow().credentials.clone()
    }

    /// Returns the credentials and the generation they belong to.
    pub fn snapshot(&self) -> CredentialSnapshot {
        self.inner.slot.borrow().clone()
    }

    pub fn generation(&self) -> u64 {
        self.inner.slot.borrow().generation
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.slot.borrow().credentials.is_some()
    }

    /// Atomically replaces the credentials.
    pub fn set(&self, credentials: CredentialPair) {
        // Persisting under the slot's write lock keeps storage and memory in
        // the same order when writers race.
        self.inner.slot.send_modify(|slot| {
            self.persist(Some(&credentials));
            slot.credentials = Some(credentials);
            slot.generation += 1;
        });
    }

    /// Atomically removes the credentials.
    pub fn clear(&self) {
        self.inner.slot.send_modify(|slot| {
            self.persist(None);
            slot.credentials = None;
            slot.generation += 1;
        });
    }

    /// Receiver that observes every replacement of the slot.
    pub fn watch(&self) -> watch::Receiver<CredentialSnapshot> {
        self.inner.slot.subscribe()
    }

    /// Subscribes to session lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Publishes a session event. Having no listeners is fine.
    pub fn notify(&self, event: SessionEvent) {
        tracing::info!(?event, "session event");
        let _ = self.inner.events.send(event);
    }

    pub fn persistor(&self) -> Option<&Persistor> {
        self.inner.persistor.as_ref()
    }

    fn persist(&self, credentials: Option<&CredentialPair>) {
        if let Some(persistor) = &self.inner.persistor
            && let Err(e) = persistor.save_credentials(credentials)
        {
            tracing::warn!(error = %e, "failed to persist credentials");
        }
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("authenticated", &self.is_authenticated())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{MemoryStore, StateStore};

    #[test]
    fn test_new_store_is_empty() {
        let store = TokenStore::new();
        assert!(store.get().is_none());
        assert!(!store.is_authenticated());
        assert_eq!(store.generation(), 0);
    }

    #[test]
    fn test_set_and_clear_bump_generation() {
        let store = TokenStore::new();

        store.set(CredentialPair::new("T1", "C1"));
        assert_eq!(store.get(), Some(CredentialPair::new("T1", "C1")));
        assert_eq!(store.generation(), 1);

        store.set(CredentialPair::new("T2", "C2"));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.credentials, Some(CredentialPair::new("T2", "C2")));
        assert_eq!(snapshot.generation, 2);

        store.clear();
        assert!(store.get().is_none());
        assert_eq!(store.generation(), 3);
    }

    #[test]
    fn test_clones_share_the_slot() {
        let store = TokenStore::new();
        let other = store.clone();
        store.set(CredentialPair::new("T1", "C1"));
        assert!(other.is_authenticated());
    }

    #[test]
    fn test_debug_hides_tokens() {
        let pair = CredentialPair::new("secret-access", "secret-csrf");
        assert!(!format!("{pair:?}").contains("secret"));
    }

    #[tokio::test]
    async fn test_watch_observes_replacement() {
        let store = TokenStore::new();
        let mut rx = store.watch();

        store.set(CredentialPair::new("T1", "C1"));
        rx.changed().await.expect("sender alive");
        assert_eq!(rx.borrow().generation, 1);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let store = TokenStore::new();
        let mut rx = store.events();
        store.notify(SessionEvent::Expired);
        assert_eq!(rx.recv().await.expect("event"), SessionEvent::Expired);
    }

    #[test]
    fn test_persisted_credentials_are_restored() {
        let backing = Arc::new(MemoryStore::new());
        let persistor = Persistor::new(backing.clone(), "root", ["profile"]);

        let store = TokenStore::with_persistor(persistor.clone());
        store.set(CredentialPair::new("T1", "C1"));

        let restored = TokenStore::with_persistor(persistor.clone());
        assert_eq!(restored.get(), Some(CredentialPair::new("T1", "C1")));

        restored.clear();
        assert!(TokenStore::with_persistor(persistor).get().is_none());
        assert!(backing.get_item("persist:root").unwrap().is_some());
    }

    #[test]
    fn test_racing_set_and_clear_persist_in_memory_order() {
        let persistor = Persistor::new(Arc::new(MemoryStore::new()), "root", ["profile"]);
        let store = TokenStore::with_persistor(persistor.clone());

        for _ in 0..200 {
            let setter = store.clone();
            let clearer = store.clone();
            let set = std::thread::spawn(move || setter.set(CredentialPair::new("T2", "C2")));
            let clear = std::thread::spawn(move || clearer.clear());
            set.join().unwrap();
            clear.join().unwrap();

            assert_eq!(persistor.load().unwrap().credentials, store.get());
        }
    }

    #[test]
    fn test_unreadable_persisted_state_starts_empty() {
        let backing = Arc::new(MemoryStore::new());
        backing.set_item("persist:root", "{broken").unwrap();
        let store = TokenStore::with_persistor(Persistor::new(backing, "root", ["profile"]));
        assert!(store.get().is_none());
    }
}
