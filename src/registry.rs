//! Accessor registry
//!
//! [`CacheCoordinator`] is the wiring layer. It binds group names to host
//! read functions ([`CacheCoordinator::cached`]) and mutating functions to
//! the groups they evict ([`CacheCoordinator::invalidates`]). The returned
//! wrappers take the same arguments as the wrapped function, passed as a
//! tuple, and apply the cache protocol around it.

use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use serde::Serialize;
use std::{collections::HashSet, future::Future, sync::Arc};
use tracing::{debug, warn};

use crate::invalidation::{InvalidationBus, MutatorId};
use crate::multiplexer::{FetchFuture, SubscriptionMultiplexer};
use crate::request_cache::{CacheGroup, RequestCache};
use crate::stats::{CacheStats, CacheStatsSnapshot};
use crate::{BoxError, CacheConfig, CacheError, CacheKey};

type FetchFn<A, V> = Arc<dyn Fn(A) -> FetchFuture<V> + Send + Sync>;
type MutateFuture<R> = BoxFuture<'static, Result<R, BoxError>>;
type MutateFn<A, R> = Arc<dyn Fn(A) -> MutateFuture<R> + Send + Sync>;

struct CoordinatorInner {
    config: CacheConfig,
    cache: RequestCache,
    multiplexer: SubscriptionMultiplexer,
    bus: InvalidationBus,
    /// Group names bound to a read accessor
    registered: Mutex<HashSet<String>>,
    stats: Arc<CacheStats>,
}

/// Owns the cache state of one host application.
///
/// Cloning is cheap and yields a handle to the same state. The state is torn
/// down when the last handle and the last wrapper are dropped.
#[derive(Clone)]
pub struct CacheCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl Default for CacheCoordinator {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl CacheCoordinator {
    pub fn new(config: CacheConfig) -> Self {
        let stats = Arc::new(CacheStats::default());
        Self {
            inner: Arc::new(CoordinatorInner {
                cache: RequestCache::new(config.initial_group_capacity, Arc::clone(&stats)),
                multiplexer: SubscriptionMultiplexer::new(Arc::clone(&stats)),
                bus: InvalidationBus::new(),
                registered: Mutex::new(HashSet::new()),
                config,
                stats,
            }),
        }
    }

    /// Wrap a read accessor so its results are cached under `group`.
    ///
    /// `fetch` receives the argument tuple; the tuple is also what the cache
    /// key is derived from. Registering the same group name twice fails with
    /// [`CacheError::DuplicateGroup`].
    pub fn cached<A, V, F, Fut, E>(
        &self,
        group: impl Into<String>,
        fetch: F,
    ) -> Result<CachedFn<A, V>, CacheError>
    where
        A: Serialize + Send + 'static,
        V: Send + Sync + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let name = validate_group_name(group.into())?;

        let group = {
            let mut registered = self.inner.registered.lock();
            if registered.contains(&name) {
                return Err(CacheError::DuplicateGroup(name));
            }
            let group = self.inner.cache.group::<V>(&name)?;
            registered.insert(name.clone());
            group
        };
        debug!("Registered cached accessor for group '{}'", name);

        let fetch: FetchFn<A, V> = Arc::new(move |args: A| -> FetchFuture<V> {
            let request = fetch(args);
            async move { request.await.map_err(Into::into) }.boxed()
        });

        Ok(CachedFn {
            inner: Arc::clone(&self.inner),
            group,
            fetch,
        })
    }

    /// Wrap a mutating accessor so that `groups` are evicted whenever it
    /// succeeds.
    ///
    /// Eviction happens before the result is returned to the caller. Failed
    /// mutations evict nothing.
    pub fn invalidates<A, R, F, Fut, E, G, S>(
        &self,
        groups: G,
        mutate: F,
    ) -> Result<InvalidatingFn<A, R>, CacheError>
    where
        G: IntoIterator<Item = S>,
        S: Into<String>,
        A: Send + 'static,
        R: Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let mut targets: Vec<String> = Vec::new();
        for group in groups {
            let name = validate_group_name(group.into())?;
            if !targets.contains(&name) {
                targets.push(name);
            }
        }
        if targets.is_empty() {
            return Err(CacheError::NoInvalidationTargets);
        }

        {
            let registered = self.inner.registered.lock();
            for target in targets.iter().filter(|t| !registered.contains(*t)) {
                if self.inner.config.strict_invalidation_targets {
                    return Err(CacheError::UnknownGroup(target.clone()));
                }
                debug!("Invalidation target '{}' has no cached accessor yet", target);
            }
        }

        let groups: Arc<[String]> = targets.into();
        let id = self.inner.bus.register(Arc::clone(&groups));

        let mutate: MutateFn<A, R> = Arc::new(move |args: A| -> MutateFuture<R> {
            let request = mutate(args);
            async move { request.await.map_err(Into::into) }.boxed()
        });

        Ok(InvalidatingFn {
            registration: Arc::new(MutatorRegistration {
                inner: Arc::clone(&self.inner),
                id,
                groups,
            }),
            mutate,
        })
    }

    /// Evict every entry of `group`. Unknown groups are a no-op.
    pub fn invalidate_group(&self, group: &str) -> usize {
        debug!("Manual invalidation of group '{}'", group);
        self.inner.cache.evict_group(group)
    }

    /// Evict every group. Registrations are kept.
    pub fn reset(&self) -> usize {
        debug!("Resetting all cache groups");
        self.inner.cache.evict_all()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn is_registered(&self, group: &str) -> bool {
        self.inner.registered.lock().contains(group)
    }

    /// Names bound to a read accessor, sorted
    pub fn registered_groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.registered.lock().iter().cloned().collect();
        names.sort();
        names
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// The underlying result table
    pub fn request_cache(&self) -> &RequestCache {
        &self.inner.cache
    }

    pub fn invalidation_bus(&self) -> &InvalidationBus {
        &self.inner.bus
    }
}

fn validate_group_name(name: String) -> Result<String, CacheError> {
    if name.trim().is_empty() {
        return Err(CacheError::InvalidGroupName(name));
    }
    Ok(name)
}

/// Cached read accessor returned by [`CacheCoordinator::cached`]
pub struct CachedFn<A, V> {
    inner: Arc<CoordinatorInner>,
    group: Arc<CacheGroup<V>>,
    fetch: FetchFn<A, V>,
}

impl<A, V> Clone for CachedFn<A, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            group: Arc::clone(&self.group),
            fetch: Arc::clone(&self.fetch),
        }
    }
}

impl<A, V> CachedFn<A, V>
where
    A: Serialize + Send + 'static,
    V: Send + Sync + 'static,
{
    /// Get the value for `args`, fetching it only on a miss.
    ///
    /// Must be called within a Tokio runtime: the underlying fetch runs on
    /// its own task.
    pub async fn call(&self, args: A) -> Result<Arc<V>, CacheError> {
        let key = CacheKey::from_args(&args)?;
        let fetch = Arc::clone(&self.fetch);
        self.inner
            .multiplexer
            .load(&self.group, key, move || fetch(args))
            .await
    }

    /// The cached value for `args`, without fetching
    pub fn peek(&self, args: &A) -> Result<Option<Arc<V>>, CacheError> {
        let key = CacheKey::from_args(args)?;
        Ok(self.group.get(&key).and_then(|entry| entry.value().cloned()))
    }

    pub fn group(&self) -> &str {
        self.group.name()
    }

    /// Evict this accessor's whole group
    pub fn invalidate(&self) -> usize {
        self.inner.cache.evict_group(self.group.name())
    }
}

/// Bus edge of one mutator, removed when the last wrapper clone is dropped
struct MutatorRegistration {
    inner: Arc<CoordinatorInner>,
    id: MutatorId,
    groups: Arc<[String]>,
}

impl Drop for MutatorRegistration {
    fn drop(&mut self) {
        self.inner.bus.unregister(self.id);
    }
}

/// Mutating accessor returned by [`CacheCoordinator::invalidates`]
pub struct InvalidatingFn<A, R> {
    registration: Arc<MutatorRegistration>,
    mutate: MutateFn<A, R>,
}

impl<A, R> Clone for InvalidatingFn<A, R> {
    fn clone(&self) -> Self {
        Self {
            registration: Arc::clone(&self.registration),
            mutate: Arc::clone(&self.mutate),
        }
    }
}

impl<A, R> InvalidatingFn<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    /// Run the mutation; on success evict the paired groups, then return
    pub async fn call(&self, args: A) -> Result<R, CacheError> {
        let MutatorRegistration { inner, id, groups } = &*self.registration;
        match (self.mutate)(args).await {
            Ok(result) => {
                inner.bus.publish(*id, &inner.cache);
                Ok(result)
            }
            Err(e) => {
                inner.stats.record_mutation_failure();
                warn!("{} failed, cached groups {:?} kept: {}", id, groups, e);
                Err(CacheError::underlying(e))
            }
        }
    }

    pub fn id(&self) -> MutatorId {
        self.registration.id
    }

    /// Groups evicted on success
    pub fn groups(&self) -> &[String] {
        &self.registration.groups
    }
}
