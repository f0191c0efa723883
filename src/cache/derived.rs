use std::{
    collections::{HashMap, HashSet},
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use futures::{future::BoxFuture, FutureExt};

use crate::{
    cache::{
        ReadThroughCache, RefreshDirective, RefreshStrategy, Refreshed, WeakReadThroughCache,
    },
    Result,
};

/// A source of shared values that a [`DerivedResourceCache`] can be built on.
pub trait Upstream<K, U>: Send + Sync + 'static {
    /// Get the latest value for `key`, refreshing it first.
    fn latest(&self, key: &K) -> BoxFuture<'static, Result<Option<Arc<U>>>>;

    /// Call `listener` every time a new value for `key` is produced.
    fn subscribe(&self, key: K, listener: Box<dyn Fn(&K, &Arc<U>) + Send + Sync>);
}

impl<K, U, S> Upstream<K, U> for ReadThroughCache<K, Arc<U>, S>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    U: Send + Sync + 'static,
    S: RefreshStrategy<K, Arc<U>>,
{
    fn latest(&self, key: &K) -> BoxFuture<'static, Result<Option<Arc<U>>>> {
        let cache = self.clone();
        let key = key.clone();
        async move {
            cache
                .get_async(&key, Some(RefreshDirective::RefreshAndAwait))
                .await
        }
        .boxed()
    }

    fn subscribe(&self, key: K, listener: Box<dyn Fn(&K, &Arc<U>) + Send + Sync>) {
        self.on(key, listener);
    }
}

/// A derived object together with the upstream value it was built from.
pub struct Derived<U, D> {
    source: Arc<U>,
    value: Arc<D>,
}

impl<U, D> Derived<U, D> {
    pub fn source(&self) -> &Arc<U> {
        &self.source
    }

    pub fn value(&self) -> &Arc<D> {
        &self.value
    }
}

type Builder<U, D> = Arc<dyn Fn(&U) -> Result<D> + Send + Sync>;

type DerivedCache<K, U, D> = ReadThroughCache<K, Arc<Derived<U, D>>, DerivedStrategy<K, U, D>>;

/// [`RefreshStrategy`] that builds derived objects from an [`Upstream`].
pub struct DerivedStrategy<K, U, D> {
    chain: Arc<Chain<K, U, D>>,
}

struct Chain<K, U, D> {
    upstream: Arc<dyn Upstream<K, U>>,
    build: Builder<U, D>,
    /// The cache this strategy belongs to.
    this: WeakReadThroughCache<K, Arc<Derived<U, D>>, DerivedStrategy<K, U, D>>,
    subscribed: Mutex<HashSet<K>>,
    /// Latest upstream value announced through a subscription, not yet consumed by a refresh.
    notified: Mutex<HashMap<K, Arc<U>>>,
}

impl<K, U, D> Chain<K, U, D>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    U: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    fn notified(&self) -> MutexGuard<'_, HashMap<K, Arc<U>>> {
        self.notified
            .lock()
            .expect("thread holding notification lock should not panic")
    }

    async fn latest_source(&self, key: &K) -> Result<Option<Arc<U>>> {
        let announced = self.notified().remove(key);
        if announced.is_some() {
            return Ok(announced);
        }

        let latest = self.upstream.latest(key).await?;

        // Pulling may have produced a new upstream value, which was also announced to us. Drop
        // the announcement so the next refresh doesn't settle for it instead of pulling.
        if let Some(latest) = &latest {
            let mut notified = self.notified();
            if notified
                .get(key)
                .is_some_and(|announced| Arc::ptr_eq(announced, latest))
            {
                notified.remove(key);
            }
        }

        Ok(latest)
    }

    /// Subscribe to upstream changes of `key`, unless already subscribed.
    fn subscribe_once(self: &Arc<Self>, key: &K) {
        let newly_subscribed = self
            .subscribed
            .lock()
            .expect("thread holding subscription lock should not panic")
            .insert(key.clone());
        if !newly_subscribed {
            return;
        }

        let chain = Arc::downgrade(self);
        self.upstream.subscribe(
            key.clone(),
            Box::new(move |key: &K, source: &Arc<U>| {
                let Some(chain) = Weak::upgrade(&chain) else {
                    return;
                };
                chain.notified().insert(key.clone(), Arc::clone(source));
                if let Some(cache) = chain.this.upgrade() {
                    log::debug!(target: "decision_core", "upstream changed, refreshing derived cache");
                    cache.refresh_in_background(key);
                }
            }),
        );
    }
}

impl<K, U, D> RefreshStrategy<K, Arc<Derived<U, D>>> for DerivedStrategy<K, U, D>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    U: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    fn refresh(
        &self,
        key: &K,
        current: Option<&Arc<Derived<U, D>>>,
    ) -> BoxFuture<'static, Result<Refreshed<Arc<Derived<U, D>>>>> {
        let chain = Arc::clone(&self.chain);
        let key = key.clone();
        let current_source = current.map(|current| Arc::clone(&current.source));

        async move {
            let Some(source) = chain.latest_source(&key).await? else {
                return Ok(Refreshed::Unchanged);
            };

            if current_source.is_some_and(|current| Arc::ptr_eq(&current, &source)) {
                return Ok(Refreshed::Unchanged);
            }

            let value = (chain.build)(source.as_ref())?;
            chain.subscribe_once(&key);

            Ok(Refreshed::Fresh(Arc::new(Derived {
                source,
                value: Arc::new(value),
            })))
        }
        .boxed()
    }
}

/// A read-through cache of objects derived from the values of an [`Upstream`].
///
/// A derived object is rebuilt only when the upstream value it was built from is replaced (by
/// identity). After the first build for a key, the cache follows upstream changes of that key on
/// its own. Since a `DerivedResourceCache` is an [`Upstream`] itself, derived caches can be
/// chained and changes propagate through the whole chain.
pub struct DerivedResourceCache<K, U, D> {
    cache: DerivedCache<K, U, D>,
}

impl<K, U, D> Clone for DerivedResourceCache<K, U, D> {
    fn clone(&self) -> Self {
        DerivedResourceCache {
            cache: self.cache.clone(),
        }
    }
}

impl<K, U, D> DerivedResourceCache<K, U, D>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    U: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    pub fn new(
        upstream: impl Upstream<K, U>,
        build: impl Fn(&U) -> Result<D> + Send + Sync + 'static,
    ) -> DerivedResourceCache<K, U, D> {
        let upstream: Arc<dyn Upstream<K, U>> = Arc::new(upstream);
        let build: Builder<U, D> = Arc::new(build);
        let cache = ReadThroughCache::new_cyclic(|this| DerivedStrategy {
            chain: Arc::new(Chain {
                upstream,
                build,
                this,
                subscribed: Mutex::new(HashSet::new()),
                notified: Mutex::new(HashMap::new()),
            }),
        });
        DerivedResourceCache { cache }
    }

    /// Get the currently cached derived object without triggering a refresh.
    pub fn get(&self, key: &K) -> Option<Arc<D>> {
        self.cache.get(key).map(|derived| Arc::clone(&derived.value))
    }

    /// Get the currently cached derived object along with its source.
    pub fn get_derived(&self, key: &K) -> Option<Arc<Derived<U, D>>> {
        self.cache.get(key)
    }

    /// See [`ReadThroughCache::get_async`].
    pub async fn get_async(
        &self,
        key: &K,
        directive: Option<RefreshDirective>,
    ) -> Result<Option<Arc<D>>> {
        let derived = self.cache.get_async(key, directive).await?;
        Ok(derived.map(|derived| Arc::clone(&derived.value)))
    }

    /// Rebuild the derived object if the upstream value changed.
    pub async fn exec_refresh(&self, key: &K) -> Result<Refreshed<Arc<D>>> {
        Ok(match self.cache.exec_refresh(key).await? {
            Refreshed::Fresh(derived) => Refreshed::Fresh(Arc::clone(&derived.value)),
            Refreshed::Unchanged => Refreshed::Unchanged,
        })
    }

    /// Subscribe to rebuilt derived objects of `key`.
    pub fn on(&self, key: K, listener: impl Fn(&K, &Arc<D>) + Send + Sync + 'static) {
        self.cache
            .on(key, move |key, derived| listener(key, &derived.value));
    }
}

impl<K, U, D> Upstream<K, D> for DerivedResourceCache<K, U, D>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    U: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    fn latest(&self, key: &K) -> BoxFuture<'static, Result<Option<Arc<D>>>> {
        let cache = self.clone();
        let key = key.clone();
        async move {
            cache
                .get_async(&key, Some(RefreshDirective::RefreshAndAwait))
                .await
        }
        .boxed()
    }

    fn subscribe(&self, key: K, listener: Box<dyn Fn(&K, &Arc<D>) + Send + Sync>) {
        self.on(key, listener);
    }
}
