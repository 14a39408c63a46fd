//! Request coalescing
//!
//! At most one underlying fetch runs per (group, key). The first caller to
//! miss installs a `Pending` entry and spawns the fetch; every caller that
//! arrives while it is pending is appended to the entry's waiter list. When
//! the fetch finishes, all waiters receive the same outcome in the order they
//! registered.
//!
//! The fetch runs on its own task, so a caller dropping its future only drops
//! its own receiver: the fetch still completes and settles the entry.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::request_cache::{CacheGroup, Lookup};
use crate::stats::CacheStats;
use crate::{BoxError, CacheError, CacheKey};

/// Outcome delivered to every waiter of one fetch
pub(crate) type FetchOutcome<V> = Result<Arc<V>, CacheError>;

/// Future produced by a type-erased host fetch function
pub(crate) type FetchFuture<V> = BoxFuture<'static, Result<V, BoxError>>;

/// An underlying fetch that callers can wait on
pub struct InFlight<V> {
    id: u64,
    started_at: Instant,
    waiters: Mutex<Vec<oneshot::Sender<FetchOutcome<V>>>>,
}

impl<V> InFlight<V> {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            started_at: Instant::now(),
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Identifier of the fetch, unique within a coordinator
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Callers currently attached, abandoned ones included
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    pub(crate) fn attach(&self) -> oneshot::Receiver<FetchOutcome<V>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push(tx);
        rx
    }

    /// Take the waiters in registration order
    pub(crate) fn drain(&self) -> Vec<oneshot::Sender<FetchOutcome<V>>> {
        std::mem::take(&mut *self.waiters.lock())
    }
}

/// Guard that ensures a pending entry is settled even on panic/cancel.
///
/// When dropped without [`InFlightGuard::complete`], the fetch is treated as
/// failed: the entry is removed and waiters receive
/// [`CacheError::FetchAborted`].
struct InFlightGuard<V>
where
    V: Send + Sync + 'static,
{
    group: Arc<CacheGroup<V>>,
    key: CacheKey,
    in_flight: Option<Arc<InFlight<V>>>,
    stats: Arc<CacheStats>,
}

impl<V> InFlightGuard<V>
where
    V: Send + Sync + 'static,
{
    fn new(
        group: Arc<CacheGroup<V>>,
        key: CacheKey,
        in_flight: Arc<InFlight<V>>,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            group,
            key,
            in_flight: Some(in_flight),
            stats,
        }
    }

    /// Complete the fetch with a result, consuming the guard.
    fn complete(mut self, outcome: FetchOutcome<V>) {
        if let Some(in_flight) = self.in_flight.take() {
            self.settle(&in_flight, outcome);
        }
    }

    fn settle(&self, in_flight: &Arc<InFlight<V>>, outcome: FetchOutcome<V>) {
        let group = self.group.name();
        if let Err(e) = &outcome {
            self.stats.record_fetch_failure();
            warn!(
                "Fetch {} failed for group '{}' key {}: {}",
                in_flight.id(),
                group,
                self.key,
                e
            );
        }

        let settled = self.group.settle(&self.key, in_flight, &outcome);
        if !settled.committed && outcome.is_ok() {
            self.stats.record_discarded();
            warn!(
                "Group '{}' was evicted while fetch {} for key {} was in flight; result not cached",
                group,
                in_flight.id(),
                self.key
            );
        }

        debug!(
            "Fetch {} for group '{}' key {} settled after {:?}, notifying {} waiters",
            in_flight.id(),
            group,
            self.key,
            in_flight.started_at().elapsed(),
            settled.waiters.len()
        );
        for tx in settled.waiters {
            // A closed receiver means that caller lost interest
            let _ = tx.send(outcome.clone());
        }
    }
}

impl<V> Drop for InFlightGuard<V>
where
    V: Send + Sync + 'static,
{
    fn drop(&mut self) {
        // Still holding the fetch here means a panic or cancellation occurred
        if let Some(in_flight) = self.in_flight.take() {
            error!(
                "Fetch {} for group '{}' key {} was aborted",
                in_flight.id(),
                self.group.name(),
                self.key
            );
            let aborted = CacheError::FetchAborted {
                group: self.group.name().to_owned(),
            };
            self.settle(&in_flight, Err(aborted));
        }
    }
}

/// Collapses concurrent identical requests into one underlying fetch
pub struct SubscriptionMultiplexer {
    next_fetch_id: AtomicU64,
    stats: Arc<CacheStats>,
}

impl SubscriptionMultiplexer {
    pub(crate) fn new(stats: Arc<CacheStats>) -> Self {
        Self {
            next_fetch_id: AtomicU64::new(1),
            stats,
        }
    }

    /// Get the value for `key`, issuing `fetch` only if nothing is cached or
    /// in flight for it.
    ///
    /// The fetch is spawned onto the current Tokio runtime.
    pub(crate) async fn load<V, F>(
        &self,
        group: &Arc<CacheGroup<V>>,
        key: CacheKey,
        fetch: F,
    ) -> Result<Arc<V>, CacheError>
    where
        V: Send + Sync + 'static,
        F: FnOnce() -> FetchFuture<V>,
    {
        let lookup =
            group.lookup_or_begin(&key, || self.next_fetch_id.fetch_add(1, Ordering::Relaxed));

        let rx = match lookup {
            Lookup::Hit(value) => {
                self.stats.record_hit();
                debug!("Cache hit for group '{}' key {}", group.name(), key);
                return Ok(value);
            }
            Lookup::Attached(rx) => {
                self.stats.record_coalesced();
                debug!(
                    "Waiting for in-flight fetch for group '{}' key {}",
                    group.name(),
                    key
                );
                rx
            }
            Lookup::Leader { in_flight, rx } => {
                self.stats.record_miss();
                debug!(
                    "Cache miss for group '{}' key {}, issuing fetch {}",
                    group.name(),
                    key,
                    in_flight.id()
                );

                // The guard exists before the host function runs so that a
                // panic while building the request still settles the entry
                let guard =
                    InFlightGuard::new(Arc::clone(group), key, in_flight, Arc::clone(&self.stats));
                let request = fetch();
                tokio::spawn(async move {
                    let outcome = request.await.map(Arc::new).map_err(CacheError::underlying);
                    guard.complete(outcome);
                });
                rx
            }
        };

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(CacheError::FetchAborted {
                group: group.name().to_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request_cache::RequestCache;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    #[derive(Debug, thiserror::Error)]
    #[error("backend unavailable")]
    struct BackendDown;

    type GatedFetch = Box<dyn FnOnce() -> FetchFuture<String> + Send>;

    struct Harness {
        stats: Arc<CacheStats>,
        cache: RequestCache,
        mux: SubscriptionMultiplexer,
        calls: Arc<AtomicUsize>,
        gate: Arc<Notify>,
    }

    impl Harness {
        fn new() -> Self {
            let stats = Arc::new(CacheStats::default());
            Self {
                cache: RequestCache::new(4, Arc::clone(&stats)),
                mux: SubscriptionMultiplexer::new(Arc::clone(&stats)),
                stats,
                calls: Arc::new(AtomicUsize::new(0)),
                gate: Arc::new(Notify::new()),
            }
        }

        fn group(&self) -> Arc<CacheGroup<String>> {
            self.cache.group::<String>("case-detail").unwrap()
        }

        /// Fetch that counts calls and blocks until the gate opens
        fn gated(&self, result: Result<&'static str, ()>) -> GatedFetch {
            let calls = Arc::clone(&self.calls);
            let gate = Arc::clone(&self.gate);
            Box::new(move || {
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    match result {
                        Ok(v) => Ok(v.to_owned()),
                        Err(()) => Err(Box::new(BackendDown) as BoxError),
                    }
                }
                .boxed()
            })
        }
    }

    fn key() -> CacheKey {
        CacheKey::from_args(&("org1", "case42")).unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_reads_share_one_fetch() {
        let h = Harness::new();
        let group = h.group();

        let (a, b, c, ()) = tokio::join!(
            h.mux.load(&group, key(), h.gated(Ok("V1"))),
            h.mux.load(&group, key(), h.gated(Ok("V1"))),
            h.mux.load(&group, key(), h.gated(Ok("V1"))),
            async { h.gate.notify_one() },
        );

        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert_eq!(a.as_str(), "V1");
        assert!(Arc::ptr_eq(&a, &b) && Arc::ptr_eq(&b, &c));
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);

        let snapshot = h.stats.snapshot();
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.coalesced, 2);

        // Later reads are hits
        let d = h.mux.load(&group, key(), h.gated(Ok("other"))).await.unwrap();
        assert!(Arc::ptr_eq(&a, &d));
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.stats.snapshot().hits, 1);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_cached() {
        let h = Harness::new();
        let group = h.group();

        let (a, b, ()) = tokio::join!(
            h.mux.load(&group, key(), h.gated(Err(()))),
            h.mux.load(&group, key(), h.gated(Err(()))),
            async { h.gate.notify_one() },
        );

        let (a, b) = (a.unwrap_err(), b.unwrap_err());
        let (a, b) = (a.underlying_error().unwrap(), b.underlying_error().unwrap());
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(a.to_string(), "backend unavailable");
        assert!(group.get(&key()).is_none());

        // The next read goes back to the source
        h.gate.notify_one();
        let v = h.mux.load(&group, key(), h.gated(Ok("V2"))).await.unwrap();
        assert_eq!(v.as_str(), "V2");
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.stats.snapshot().fetch_failures, 1);
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_cancel_fetch() {
        let h = Harness::new();
        let group = h.group();

        // Leader is polled once then dropped
        {
            let leader = h.mux.load(&group, key(), h.gated(Ok("V1")));
            futures::pin_mut!(leader);
            assert!(futures::poll!(leader.as_mut()).is_pending());
        }
        assert!(group.get(&key()).unwrap().is_pending());

        let waiter = h.mux.load(&group, key(), h.gated(Ok("other")));
        h.gate.notify_one();
        assert_eq!(waiter.await.unwrap().as_str(), "V1");
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_fetch_is_aborted_and_removed() {
        let h = Harness::new();
        let group = h.group();

        async fn explode() -> Result<String, BoxError> {
            panic!("fetch exploded")
        }

        let result = h.mux.load(&group, key(), || explode().boxed()).await;

        assert!(matches!(result, Err(CacheError::FetchAborted { .. })));
        assert!(group.get(&key()).is_none());
        assert_eq!(h.stats.snapshot().fetch_failures, 1);
    }

    #[tokio::test]
    async fn test_eviction_while_pending_delivers_but_does_not_cache() {
        let h = Harness::new();
        let group = h.group();

        let pending = tokio::spawn({
            let group = Arc::clone(&group);
            let stats = Arc::clone(&h.stats);
            let fetch = h.gated(Ok("V1"));
            async move {
                let mux = SubscriptionMultiplexer::new(stats);
                mux.load(&group, key(), fetch).await
            }
        });

        while group.get(&key()).is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.cache.evict_group("case-detail"), 1);
        h.gate.notify_one();

        assert_eq!(pending.await.unwrap().unwrap().as_str(), "V1");
        assert!(group.get(&key()).is_none());
        assert_eq!(h.stats.snapshot().discarded_results, 1);
    }

    #[test]
    fn test_waiters_drain_in_registration_order() {
        let in_flight = InFlight::<u32>::new(7);
        let receivers: Vec<_> = (0..3).map(|_| in_flight.attach()).collect();
        assert_eq!(in_flight.waiter_count(), 3);

        for (i, tx) in in_flight.drain().into_iter().enumerate() {
            tx.send(Ok(Arc::new(i as u32))).unwrap();
        }
        assert_eq!(in_flight.waiter_count(), 0);

        for (i, mut rx) in receivers.into_iter().enumerate() {
            assert_eq!(*rx.try_recv().unwrap().unwrap(), i as u32);
        }
    }
}
