//! Grouped result table
//!
//! Each named group maps a [`CacheKey`] to a [`CacheEntry`]. A group holds a
//! single value type; the [`RequestCache`] indexes groups of different value
//! types behind a type-erased handle so they can be evicted by name.

use parking_lot::{Mutex, RwLock};
use std::{
    any::Any,
    collections::{HashMap, hash_map::Entry},
    fmt,
    sync::Arc,
    time::Instant,
};
use tokio::sync::oneshot;
use tracing::debug;

use crate::multiplexer::{FetchOutcome, InFlight};
use crate::stats::CacheStats;
use crate::{CacheError, CacheKey};

/// State of one key within a group
pub enum CacheEntry<V> {
    /// An underlying fetch is in flight; callers attach to it
    Pending(Arc<InFlight<V>>),
    /// The fetched value and the moment it was stored
    Resolved { value: Arc<V>, captured_at: Instant },
}

impl<V> CacheEntry<V> {
    /// A resolved entry captured now
    pub fn resolved(value: V) -> Self {
        CacheEntry::Resolved {
            value: Arc::new(value),
            captured_at: Instant::now(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, CacheEntry::Pending(_))
    }

    /// The resolved value, if any
    pub fn value(&self) -> Option<&Arc<V>> {
        match self {
            CacheEntry::Resolved { value, .. } => Some(value),
            CacheEntry::Pending(_) => None,
        }
    }

    /// When the resolved value was stored
    pub fn captured_at(&self) -> Option<Instant> {
        match self {
            CacheEntry::Resolved { captured_at, .. } => Some(*captured_at),
            CacheEntry::Pending(_) => None,
        }
    }
}

impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        match self {
            CacheEntry::Pending(in_flight) => CacheEntry::Pending(Arc::clone(in_flight)),
            CacheEntry::Resolved { value, captured_at } => CacheEntry::Resolved {
                value: Arc::clone(value),
                captured_at: *captured_at,
            },
        }
    }
}

impl<V> fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheEntry::Pending(in_flight) => f
                .debug_struct("Pending")
                .field("fetch_id", &in_flight.id())
                .field("waiters", &in_flight.waiter_count())
                .finish(),
            CacheEntry::Resolved { captured_at, .. } => f
                .debug_struct("Resolved")
                .field("captured_at", captured_at)
                .finish_non_exhaustive(),
        }
    }
}

/// Result of a single-lock lookup performed by the multiplexer
pub(crate) enum Lookup<V> {
    Hit(Arc<V>),
    Attached(oneshot::Receiver<FetchOutcome<V>>),
    Leader {
        in_flight: Arc<InFlight<V>>,
        rx: oneshot::Receiver<FetchOutcome<V>>,
    },
}

/// Waiters released by settling an in-flight fetch
pub(crate) struct Settled<V> {
    /// Whether the outcome was applied to the table
    pub(crate) committed: bool,
    pub(crate) waiters: Vec<oneshot::Sender<FetchOutcome<V>>>,
}

/// One named partition of the cache
pub struct CacheGroup<V> {
    name: String,
    entries: Mutex<HashMap<CacheKey, CacheEntry<V>>>,
}

impl<V> fmt::Debug for CacheGroup<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheGroup")
            .field("name", &self.name)
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

impl<V> CacheGroup<V>
where
    V: Send + Sync + 'static,
{
    fn new(name: String, capacity: usize) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current entry for `key`
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        self.entries.lock().get(key).cloned()
    }

    /// Replace the entry for `key`, returning the previous one.
    ///
    /// Only `Resolved` entries are accepted: a `Pending` entry is settled by
    /// the fetch that installed it, and only under its own key.
    pub fn put(
        &self,
        key: CacheKey,
        entry: CacheEntry<V>,
    ) -> Result<Option<CacheEntry<V>>, CacheError> {
        if entry.is_pending() {
            return Err(CacheError::PendingEntryRejected {
                group: self.name.clone(),
            });
        }
        Ok(self.entries.lock().insert(key, entry))
    }

    /// Remove every entry, returning how many were removed
    pub fn evict(&self) -> usize {
        let mut entries = self.entries.lock();
        let removed = entries.len();
        entries.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Resolve a hit, attach to an in-flight fetch, or install a new
    /// `Pending` entry with the caller registered as its first waiter.
    pub(crate) fn lookup_or_begin(
        &self,
        key: &CacheKey,
        next_fetch_id: impl FnOnce() -> u64,
    ) -> Lookup<V> {
        let mut entries = self.entries.lock();
        match entries.entry(key.clone()) {
            Entry::Occupied(occupied) => match occupied.get() {
                CacheEntry::Resolved { value, .. } => Lookup::Hit(Arc::clone(value)),
                CacheEntry::Pending(in_flight) => Lookup::Attached(in_flight.attach()),
            },
            Entry::Vacant(vacant) => {
                let in_flight = Arc::new(InFlight::new(next_fetch_id()));
                let rx = in_flight.attach();
                vacant.insert(CacheEntry::Pending(Arc::clone(&in_flight)));
                Lookup::Leader { in_flight, rx }
            }
        }
    }

    /// Apply a finished fetch and release its waiters.
    ///
    /// The table is only touched while it still holds this exact `Pending`
    /// entry; an entry evicted or replaced in the meantime is left alone.
    pub(crate) fn settle(
        &self,
        key: &CacheKey,
        in_flight: &Arc<InFlight<V>>,
        outcome: &FetchOutcome<V>,
    ) -> Settled<V> {
        let mut entries = self.entries.lock();
        let committed = matches!(
            entries.get(key),
            Some(CacheEntry::Pending(current)) if Arc::ptr_eq(current, in_flight)
        );

        if committed {
            match outcome {
                Ok(value) => {
                    entries.insert(
                        key.clone(),
                        CacheEntry::Resolved {
                            value: Arc::clone(value),
                            captured_at: Instant::now(),
                        },
                    );
                }
                Err(_) => {
                    entries.remove(key);
                }
            }
        }

        // Drained under the table lock so no caller can attach afterwards
        let waiters = in_flight.drain();
        Settled { committed, waiters }
    }
}

/// Type-erased view of a [`CacheGroup`]
trait ErasedGroup: Send + Sync {
    fn evict(&self) -> usize;
    fn len(&self) -> usize;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<V> ErasedGroup for CacheGroup<V>
where
    V: Send + Sync + 'static,
{
    fn evict(&self) -> usize {
        CacheGroup::evict(self)
    }

    fn len(&self) -> usize {
        CacheGroup::len(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn downcast<V>(name: &str, group: Arc<dyn ErasedGroup>) -> Result<Arc<CacheGroup<V>>, CacheError>
where
    V: Send + Sync + 'static,
{
    group
        .into_any()
        .downcast::<CacheGroup<V>>()
        .map_err(|_| CacheError::GroupTypeMismatch {
            group: name.to_owned(),
        })
}

/// Thread-safe storage of entries keyed by (group, key)
pub struct RequestCache {
    groups: RwLock<HashMap<String, Arc<dyn ErasedGroup>>>,
    initial_group_capacity: usize,
    stats: Arc<CacheStats>,
}

impl RequestCache {
    pub(crate) fn new(initial_group_capacity: usize, stats: Arc<CacheStats>) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            initial_group_capacity,
            stats,
        }
    }

    /// Typed handle to `name`, creating the group on first reference
    pub fn group<V>(&self, name: &str) -> Result<Arc<CacheGroup<V>>, CacheError>
    where
        V: Send + Sync + 'static,
    {
        if let Some(existing) = self.existing(name) {
            return downcast(name, existing);
        }

        let group = {
            let mut groups = self.groups.write();
            let capacity = self.initial_group_capacity;
            Arc::clone(groups.entry(name.to_owned()).or_insert_with(|| {
                debug!("Creating cache group '{}'", name);
                Arc::new(CacheGroup::<V>::new(name.to_owned(), capacity)) as Arc<dyn ErasedGroup>
            }))
        };
        downcast(name, group)
    }

    /// Entry for (`group`, `key`); an unknown group has no entries
    pub fn get<V>(&self, group: &str, key: &CacheKey) -> Result<Option<CacheEntry<V>>, CacheError>
    where
        V: Send + Sync + 'static,
    {
        match self.existing(group) {
            Some(existing) => Ok(downcast::<V>(group, existing)?.get(key)),
            None => Ok(None),
        }
    }

    /// Atomically replace the entry for (`group`, `key`); `Pending` entries
    /// are rejected
    pub fn put<V>(&self, group: &str, key: CacheKey, entry: CacheEntry<V>) -> Result<(), CacheError>
    where
        V: Send + Sync + 'static,
    {
        self.group::<V>(group)?.put(key, entry)?;
        Ok(())
    }

    /// Remove every entry of `group`. Unknown groups are a no-op.
    pub fn evict_group(&self, group: &str) -> usize {
        let Some(existing) = self.existing(group) else {
            debug!("Eviction of unknown group '{}' ignored", group);
            return 0;
        };

        let removed = existing.evict();
        self.stats.record_eviction(removed);
        debug!("Evicted {} entries from group '{}'", removed, group);
        removed
    }

    /// Remove every entry of every group; the groups themselves remain
    pub fn evict_all(&self) -> usize {
        let groups: Vec<(String, Arc<dyn ErasedGroup>)> = self
            .groups
            .read()
            .iter()
            .map(|(name, group)| (name.clone(), Arc::clone(group)))
            .collect();

        groups
            .into_iter()
            .map(|(name, group)| {
                let removed = group.evict();
                self.stats.record_eviction(removed);
                debug!("Evicted {} entries from group '{}'", removed, name);
                removed
            })
            .sum()
    }

    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of entries in `group`, pending ones included
    pub fn len(&self, group: &str) -> usize {
        self.existing(group).map(|g| g.len()).unwrap_or(0)
    }

    fn existing(&self, name: &str) -> Option<Arc<dyn ErasedGroup>> {
        self.groups.read().get(name).cloned()
    }
}
