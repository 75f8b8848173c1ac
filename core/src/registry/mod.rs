//! Registries of in-flight cancellable operations.
//!
//! - **KeyedRegistry**: one live [`CancellableHandle`] per key; installing
//!   over an occupied key cancels the previous occupant first
//! - **ConnectionRegistry**: connection attempts and established links per
//!   device address
//! - **TransactionRegistry**: reads, writes and monitors per caller-supplied
//!   transaction id
//!
//! Every table sits behind its own mutex which is only held for the map
//! mutation. Release callbacks run after the guard is dropped, so a callback
//! may call back into the registry that invoked it.

pub mod connections;
pub mod transactions;

pub use connections::{ConnectionAttempt, ConnectionRegistry, DisconnectObserver};
pub use transactions::TransactionRegistry;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

type ReleaseFn = Box<dyn FnOnce() + Send + 'static>;

/// Wrapper around one in-flight asynchronous operation.
///
/// The handle settles exactly once: either [`cancel`](Self::cancel) runs the
/// release callback, or [`disarm`](Self::disarm) claims the handle for normal
/// completion and the callback is dropped unrun. Whichever happens first wins.
pub struct CancellableHandle {
    id: u64,
    scope: Option<String>,
    token: CancellationToken,
    release: Mutex<Option<ReleaseFn>>,
}

impl CancellableHandle {
    /// Create a handle whose release callback runs on cancellation.
    pub fn new<F>(release: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(None, Box::new(release))
    }

    /// Create a handle tagged with the device address it operates on.
    pub fn scoped<F>(scope: impl Into<String>, release: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(Some(scope.into()), Box::new(release))
    }

    /// Like [`scoped`](Self::scoped), but the release callback is told the
    /// id of the handle it belongs to.
    pub fn scoped_with_id<F>(scope: impl Into<String>, release: F) -> Arc<Self>
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
        Self::with_id(id, Some(scope.into()), Box::new(move || release(id)))
    }

    fn build(scope: Option<String>, release: ReleaseFn) -> Arc<Self> {
        Self::with_id(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed), scope, release)
    }

    fn with_id(id: u64, scope: Option<String>, release: ReleaseFn) -> Arc<Self> {
        Arc::new(Self {
            id,
            scope,
            token: CancellationToken::new(),
            release: Mutex::new(Some(release)),
        })
    }

    /// Unique identity of this handle, distinct across every registry
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Token threaded through every stage of the operation
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the operation. The token fires every time, the release callback
    /// at most once. Returns whether this call ran the callback.
    pub fn cancel(&self) -> bool {
        self.token.cancel();
        let release = self.release.lock().take();
        match release {
            Some(release) => {
                release();
                true
            }
            None => false,
        }
    }

    /// Claim the handle for normal completion. Returns false if the handle
    /// was already cancelled or disarmed; the caller must then drop its
    /// result.
    pub fn disarm(&self) -> bool {
        self.release.lock().take().is_some()
    }

    /// Whether neither `cancel` nor `disarm` has settled the handle yet
    pub fn is_live(&self) -> bool {
        self.release.lock().is_some()
    }
}

impl fmt::Debug for CancellableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellableHandle")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Mapping from a key to at most one live [`CancellableHandle`]
pub struct KeyedRegistry<K> {
    name: &'static str,
    entries: Mutex<HashMap<K, Arc<CancellableHandle>>>,
}

impl<K> KeyedRegistry<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    /// Create an empty registry; `name` only appears in logs
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Store `handle` under `key`, cancelling any previous occupant first.
    pub fn install(&self, key: K, handle: Arc<CancellableHandle>) -> Arc<CancellableHandle> {
        let previous = self.entries.lock().insert(key.clone(), Arc::clone(&handle));
        if let Some(previous) = previous {
            debug!("{}: {:?} superseded (handle {})", self.name, key, previous.id());
            previous.cancel();
        }
        handle
    }

    /// Cancel and remove whatever is stored under `key`.
    pub fn cancel(&self, key: &K) -> bool {
        let removed = self.entries.lock().remove(key);
        match removed {
            Some(handle) => {
                debug!("{}: {:?} cancelled (handle {})", self.name, key, handle.id());
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the mapping only if it still points at `handle`.
    pub fn remove_if_owner(&self, key: &K, handle: &CancellableHandle) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(current) if current.id() == handle.id() => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Cancel and remove every entry matching `predicate`; returns the keys.
    pub fn cancel_where<F>(&self, mut predicate: F) -> Vec<K>
    where
        F: FnMut(&K, &CancellableHandle) -> bool,
    {
        let removed: Vec<(K, Arc<CancellableHandle>)> = {
            let mut entries = self.entries.lock();
            let keys: Vec<K> = entries
                .iter()
                .filter(|(key, handle)| predicate(key, handle))
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.remove(&key).map(|handle| (key, handle)))
                .collect()
        };

        removed
            .into_iter()
            .map(|(key, handle)| {
                debug!("{}: {:?} cancelled (handle {})", self.name, key, handle.id());
                handle.cancel();
                key
            })
            .collect()
    }

    /// Cancel and remove every entry.
    pub fn cancel_all(&self) -> usize {
        self.cancel_where(|_, _| true).len()
    }

    pub fn get(&self, key: &K) -> Option<Arc<CancellableHandle>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handle(counter: &Arc<AtomicUsize>) -> Arc<CancellableHandle> {
        let counter = Arc::clone(counter);
        CancellableHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_handle_ids_are_unique() {
        let a = CancellableHandle::new(|| {});
        let b = CancellableHandle::new(|| {});
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_release_receives_own_id() {
        let seen = Arc::new(AtomicUsize::new(0));
        let handle = {
            let seen = Arc::clone(&seen);
            CancellableHandle::scoped_with_id("AA:BB", move |id| {
                seen.store(id as usize, Ordering::SeqCst);
            })
        };
        assert_eq!(handle.scope(), Some("AA:BB"));
        handle.cancel();
        assert_eq!(seen.load(Ordering::SeqCst) as u64, handle.id());
    }

    #[test]
    fn test_cancel_runs_release_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let handle = counting_handle(&released);

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(handle.is_cancelled());
        assert!(!handle.is_live());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disarm_suppresses_release() {
        let released = Arc::new(AtomicUsize::new(0));
        let handle = counting_handle(&released);

        assert!(handle.disarm());
        assert!(!handle.disarm());
        assert!(!handle.cancel());
        assert_eq!(released.load(Ordering::SeqCst), 0);
        // The token still fires so pending stages unwind.
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_cancel_after_cancel_blocks_disarm() {
        let handle = CancellableHandle::new(|| {});
        handle.cancel();
        assert!(!handle.disarm());
    }

    #[test]
    fn test_install_supersedes_previous() {
        let registry = KeyedRegistry::new("test");
        let released = Arc::new(AtomicUsize::new(0));

        let first = registry.install("k".to_string(), counting_handle(&released));
        let second = registry.install("k".to_string(), counting_handle(&released));

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&"k".to_string()).unwrap().id(), second.id());
    }

    #[test]
    fn test_cancel_unknown_key() {
        let registry: KeyedRegistry<String> = KeyedRegistry::new("test");
        assert!(!registry.cancel(&"missing".to_string()));
    }

    #[test]
    fn test_cancel_removes_and_releases() {
        let registry = KeyedRegistry::new("test");
        let released = Arc::new(AtomicUsize::new(0));
        registry.install("k".to_string(), counting_handle(&released));

        assert!(registry.cancel(&"k".to_string()));
        assert!(registry.is_empty());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_release_does_not_remove_newer_entry() {
        let registry = KeyedRegistry::new("test");
        let old = registry.install("k".to_string(), CancellableHandle::new(|| {}));
        let new = registry.install("k".to_string(), CancellableHandle::new(|| {}));

        assert!(!registry.remove_if_owner(&"k".to_string(), &old));
        assert!(registry.contains(&"k".to_string()));
        assert!(registry.remove_if_owner(&"k".to_string(), &new));
        assert!(!registry.contains(&"k".to_string()));
    }

    #[test]
    fn test_release_may_reenter_registry() {
        let registry = Arc::new(KeyedRegistry::new("test"));
        let reentrant = Arc::clone(&registry);
        let handle = CancellableHandle::new(move || {
            // Would deadlock if the registry lock were still held.
            reentrant.cancel(&"other".to_string());
            assert_eq!(reentrant.len(), 0);
        });
        registry.install("k".to_string(), handle);
        assert!(registry.cancel(&"k".to_string()));
    }

    #[test]
    fn test_cancel_where_by_scope() {
        let registry = KeyedRegistry::new("test");
        registry.install("tx1".to_string(), CancellableHandle::scoped("AA", || {}));
        registry.install("tx2".to_string(), CancellableHandle::scoped("BB", || {}));
        registry.install("tx3".to_string(), CancellableHandle::scoped("AA", || {}));

        let mut cancelled = registry.cancel_where(|_, h| h.scope() == Some("AA"));
        cancelled.sort();
        assert_eq!(cancelled, vec!["tx1".to_string(), "tx3".to_string()]);
        assert_eq!(registry.keys(), vec!["tx2".to_string()]);
        assert_eq!(registry.cancel_all(), 1);
        assert!(registry.is_empty());
    }
}
