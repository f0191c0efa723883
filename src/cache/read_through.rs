use std::{
    collections::HashMap,
    hash::Hash,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use chrono::{DateTime, Utc};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};

use crate::{Error, Result};

/// Outcome of a single refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refreshed<V> {
    /// Refresh produced a new value.
    Fresh(V),
    /// Refresh ran and produced no new information. Stored value is left as is.
    Unchanged,
}

/// What [`ReadThroughCache::get_async`] does when the key already has a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshDirective {
    /// Return the cached value, no I/O.
    OnlyIfCacheMiss,
    /// Start a refresh without waiting for it and return the cached (possibly stale) value.
    RefreshInBackground,
    /// Wait for a refresh to complete and return the refreshed value.
    RefreshAndAwait,
}

/// Pluggable part of a [`ReadThroughCache`]: how a value is refreshed and when a cached value is
/// considered stale.
pub trait RefreshStrategy<K, V>: Send + Sync + 'static {
    /// Produce a new value for `key`. `current` is the currently cached value, if any.
    ///
    /// This is called while the cache is locked, so the returned future must do all its work
    /// lazily and must not touch the calling cache synchronously.
    fn refresh(&self, key: &K, current: Option<&V>) -> BoxFuture<'static, Result<Refreshed<V>>>;

    /// Decide what a `get_async()` without an explicit directive does on a cache hit.
    fn policy(&self, _key: &K, _entry: &CacheEntry<V>) -> RefreshDirective {
        RefreshDirective::OnlyIfCacheMiss
    }
}

impl<K, V, F> RefreshStrategy<K, V> for F
where
    F: Fn(&K, Option<&V>) -> BoxFuture<'static, Result<Refreshed<V>>> + Send + Sync + 'static,
{
    fn refresh(&self, key: &K, current: Option<&V>) -> BoxFuture<'static, Result<Refreshed<V>>> {
        self(key, current)
    }
}

/// Callback invoked with the new value whenever a refresh for the key produces one.
pub type Listener<K, V> = Arc<dyn Fn(&K, &V) + Send + Sync>;

type PendingRefresh<V> = Shared<BoxFuture<'static, Result<Refreshed<V>>>>;

/// Per-key state of a cache.
pub struct CacheEntry<V> {
    value: Option<V>,
    last_refreshed_at: Option<DateTime<Utc>>,
    pending: Option<PendingRefresh<V>>,
}

impl<V> CacheEntry<V> {
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// When the value was last replaced by a refresh. Seeded values have no refresh time.
    pub fn last_refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.last_refreshed_at
    }

    pub fn is_refreshing(&self) -> bool {
        self.pending.is_some()
    }
}

impl<V> Default for CacheEntry<V> {
    fn default() -> Self {
        CacheEntry {
            value: None,
            last_refreshed_at: None,
            pending: None,
        }
    }
}

struct State<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    listeners: HashMap<K, Vec<Listener<K, V>>>,
}

struct Inner<K, V, S> {
    strategy: S,
    state: Mutex<State<K, V>>,
}

impl<K, V, S> Inner<K, V, S> {
    fn state(&self) -> MutexGuard<'_, State<K, V>> {
        // Err() is possible only if the lock is poisoned (a thread panicked while holding the
        // lock), which should never happen as no user code runs under the lock.
        self.state
            .lock()
            .expect("thread holding cache lock should not panic")
    }
}

/// A generic read-through cache with singleflight refreshes.
///
/// Values are produced by a [`RefreshStrategy`]. At most one refresh per key is outstanding at any
/// time: callers that ask for a refresh while one is running join it and receive its result. A
/// failed refresh is reported to every joined caller and leaves the cached value untouched.
///
/// Refreshes are spawned onto the current tokio runtime and always run to completion, even if
/// every caller stops waiting. Methods that may start a refresh must be called from within a
/// tokio runtime.
///
/// `ReadThroughCache` is a cheap handle; clones share the same entries.
pub struct ReadThroughCache<K, V, S> {
    inner: Arc<Inner<K, V, S>>,
}

impl<K, V, S> Clone for ReadThroughCache<K, V, S> {
    fn clone(&self) -> Self {
        ReadThroughCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Non-owning handle to a [`ReadThroughCache`], used by strategies that need to reach back into
/// their own cache.
pub struct WeakReadThroughCache<K, V, S> {
    inner: Weak<Inner<K, V, S>>,
}

impl<K, V, S> Clone for WeakReadThroughCache<K, V, S> {
    fn clone(&self) -> Self {
        WeakReadThroughCache {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<K, V, S> WeakReadThroughCache<K, V, S> {
    pub fn upgrade(&self) -> Option<ReadThroughCache<K, V, S>> {
        self.inner.upgrade().map(|inner| ReadThroughCache { inner })
    }
}

impl<K, V, S> ReadThroughCache<K, V, S>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: RefreshStrategy<K, V>,
{
    pub fn new(strategy: S) -> ReadThroughCache<K, V, S> {
        ReadThroughCache::new_cyclic(|_| strategy)
    }

    /// Create a cache whose strategy holds a weak handle to the cache itself.
    pub fn new_cyclic(
        make_strategy: impl FnOnce(WeakReadThroughCache<K, V, S>) -> S,
    ) -> ReadThroughCache<K, V, S> {
        let inner = Arc::new_cyclic(|weak| Inner {
            strategy: make_strategy(WeakReadThroughCache {
                inner: Weak::clone(weak),
            }),
            state: Mutex::new(State {
                entries: HashMap::new(),
                listeners: HashMap::new(),
            }),
        });
        ReadThroughCache { inner }
    }

    pub fn strategy(&self) -> &S {
        &self.inner.strategy
    }

    pub fn downgrade(&self) -> WeakReadThroughCache<K, V, S> {
        WeakReadThroughCache {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Provide an initial value for `key`.
    ///
    /// Does nothing if the key already has a value. If a refresh is running for the key, the
    /// value is set and the refresh is left alone (its result will replace the seeded value).
    /// Never triggers I/O.
    pub fn seed(&self, key: K, value: V) {
        let mut state = self.inner.state();
        let entry = state.entries.entry(key).or_default();
        if entry.value.is_none() {
            entry.value = Some(value);
        }
    }

    /// Get the currently cached value without triggering a refresh.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner
            .state()
            .entries
            .get(key)
            .and_then(|entry| entry.value.clone())
    }

    pub fn last_refreshed_at(&self, key: &K) -> Option<DateTime<Utc>> {
        self.inner
            .state()
            .entries
            .get(key)
            .and_then(|entry| entry.last_refreshed_at)
    }

    /// Get a value for `key`, refreshing it as needed.
    ///
    /// On a cache miss, always refreshes and waits for the result. On a cache hit, acts according
    /// to `directive`, or to the strategy's [`policy`](RefreshStrategy::policy) if `directive` is
    /// `None`.
    ///
    /// # Errors
    ///
    /// Returns the refresh error if this call waited for a refresh that failed. The cached value
    /// is left untouched in that case.
    pub async fn get_async(
        &self,
        key: &K,
        directive: Option<RefreshDirective>,
    ) -> Result<Option<V>> {
        let cached = {
            let state = self.inner.state();
            state.entries.get(key).and_then(|entry| {
                let value = entry.value.clone()?;
                let directive =
                    directive.unwrap_or_else(|| self.inner.strategy.policy(key, entry));
                Some((value, directive))
            })
        };

        match cached {
            None | Some((_, RefreshDirective::RefreshAndAwait)) => {
                self.exec_refresh(key).await?;
                Ok(self.get(key))
            }
            Some((value, RefreshDirective::OnlyIfCacheMiss)) => Ok(Some(value)),
            Some((value, RefreshDirective::RefreshInBackground)) => {
                self.refresh_in_background(key);
                Ok(Some(value))
            }
        }
    }

    /// Subscribe to new values of `key`.
    ///
    /// Listeners are called after the value has been stored, outside of the cache lock, so they
    /// may read from the cache. They are not called for refreshes that return
    /// [`Refreshed::Unchanged`] or fail.
    pub fn on(&self, key: K, listener: impl Fn(&K, &V) + Send + Sync + 'static) {
        self.inner
            .state()
            .listeners
            .entry(key)
            .or_default()
            .push(Arc::new(listener));
    }

    /// Start refreshing `key` without waiting for the result. Does nothing if a refresh is
    /// already running.
    pub fn refresh_in_background(&self, key: &K) {
        // The refresh is already spawned; dropping the handle doesn't cancel it.
        drop(self.start_refresh(key));
    }

    /// Refresh `key`, joining the already running refresh if there is one.
    pub async fn exec_refresh(&self, key: &K) -> Result<Refreshed<V>> {
        self.start_refresh(key).await
    }

    fn start_refresh(&self, key: &K) -> PendingRefresh<V> {
        let mut state = self.inner.state();
        let entry = state.entries.entry(key.clone()).or_default();
        if let Some(pending) = &entry.pending {
            return pending.clone();
        }

        log::debug!(target: "decision_core", "starting cache refresh");
        let refresh = self.inner.strategy.refresh(key, entry.value.as_ref());
        let task = tokio::spawn(run_refresh(
            Arc::clone(&self.inner),
            key.clone(),
            refresh,
        ));
        let pending = async move { task.await.unwrap_or(Err(Error::RefreshPanicked)) }
            .boxed()
            .shared();

        // The spawned task cannot clear `pending` before we set it: it needs the lock we're
        // holding.
        entry.pending = Some(pending.clone());
        pending
    }
}

/// Await `refresh` and apply its result to the entry. Always clears the pending marker.
async fn run_refresh<K, V, S>(
    inner: Arc<Inner<K, V, S>>,
    key: K,
    refresh: BoxFuture<'static, Result<Refreshed<V>>>,
) -> Result<Refreshed<V>>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    let result = AssertUnwindSafe(refresh)
        .catch_unwind()
        .await
        .unwrap_or(Err(Error::RefreshPanicked));

    let listeners = {
        let mut guard = inner.state();
        let state = &mut *guard;
        let entry = state.entries.entry(key.clone()).or_default();
        entry.pending = None;

        match &result {
            Ok(Refreshed::Fresh(value)) => {
                entry.value = Some(value.clone());
                entry.last_refreshed_at = Some(Utc::now());
                log::debug!(target: "decision_core", "cache refresh produced a new value");
                state.listeners.get(&key).cloned().unwrap_or_default()
            }
            Ok(Refreshed::Unchanged) => {
                log::debug!(target: "decision_core", "cache refresh found no changes");
                Vec::new()
            }
            Err(err) => {
                log::warn!(target: "decision_core", "cache refresh failed, keeping previous value: {err}");
                Vec::new()
            }
        }
    };

    if let Ok(Refreshed::Fresh(value)) = &result {
        for listener in &listeners {
            listener(&key, value);
        }
    }

    result
}
