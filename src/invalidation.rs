//! Mutation-driven invalidation
//!
//! Each mutating accessor is registered with the groups it evicts. The
//! wrapper publishes to the bus only after its own request succeeded, and the
//! bus evicts synchronously, so the mutation's result is released to its
//! caller only once the paired groups are empty.

use parking_lot::RwLock;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::debug;

use crate::request_cache::RequestCache;

/// Identifier of a registered mutating accessor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutatorId(u64);

impl fmt::Display for MutatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mutator-{}", self.0)
    }
}

/// Couples mutating accessors to the groups they evict on success
#[derive(Default)]
pub struct InvalidationBus {
    edges: RwLock<HashMap<MutatorId, Arc<[String]>>>,
    next_id: AtomicU64,
}

impl InvalidationBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register an edge from a new mutator to `groups`.
    ///
    /// The edge lives until [`InvalidationBus::unregister`], which the
    /// wrapper calls once its last clone is dropped.
    pub(crate) fn register(&self, groups: Arc<[String]>) -> MutatorId {
        let id = MutatorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!("Registered {} invalidating {:?}", id, groups);
        self.edges.write().insert(id, groups);
        id
    }

    /// Remove the edge of `id`; returns whether it existed
    pub(crate) fn unregister(&self, id: MutatorId) -> bool {
        let removed = self.edges.write().remove(&id).is_some();
        if removed {
            debug!("Unregistered {}", id);
        }
        removed
    }

    /// Number of registered mutators
    pub fn len(&self) -> usize {
        self.edges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.read().is_empty()
    }

    /// Groups evicted when `id` succeeds
    pub fn groups_for(&self, id: MutatorId) -> Option<Arc<[String]>> {
        self.edges.read().get(&id).cloned()
    }

    /// Evict every group paired with `id`, returning the number of entries removed
    pub(crate) fn publish(&self, id: MutatorId, cache: &RequestCache) -> usize {
        let Some(groups) = self.groups_for(id) else {
            return 0;
        };

        let removed: usize = groups.iter().map(|group| cache.evict_group(group)).sum();
        debug!("{} succeeded; evicted {} entries from {:?}", id, removed, groups);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request_cache::CacheEntry;
    use crate::stats::CacheStats;
    use crate::CacheKey;

    #[test]
    fn test_publish_evicts_declared_groups_only() {
        let cache = RequestCache::new(4, Arc::new(CacheStats::default()));
        let key = CacheKey::from_args(&("org1", "case42")).unwrap();
        for group in ["case-detail", "related-cases", "related-objects"] {
            cache
                .put(group, key.clone(), CacheEntry::resolved(group.to_owned()))
                .unwrap();
        }

        let bus = InvalidationBus::new();
        let id = bus.register(Arc::from(vec![
            "case-detail".to_owned(),
            "related-cases".to_owned(),
        ]));

        assert_eq!(bus.publish(id, &cache), 2);
        assert_eq!(cache.len("case-detail"), 0);
        assert_eq!(cache.len("related-cases"), 0);
        assert_eq!(cache.len("related-objects"), 1);
    }

    #[test]
    fn test_unknown_targets_are_noop() {
        let cache = RequestCache::new(4, Arc::new(CacheStats::default()));
        let bus = InvalidationBus::new();
        let id = bus.register(Arc::from(vec!["never-registered".to_owned()]));

        assert_eq!(bus.publish(id, &cache), 0);
        assert!(cache.group_names().is_empty());
    }

    #[test]
    fn test_ids_are_distinct() {
        let bus = InvalidationBus::new();
        let a = bus.register(Arc::from(vec!["a".to_owned()]));
        let b = bus.register(Arc::from(vec!["a".to_owned()]));

        assert_ne!(a, b);
        assert_eq!(bus.groups_for(b).as_deref(), Some(&["a".to_owned()][..]));
    }

    #[test]
    fn test_unregister_removes_edge() {
        let cache = RequestCache::new(4, Arc::new(CacheStats::default()));
        let key = CacheKey::from_args(&("org1", "case42")).unwrap();
        cache
            .put("a", key.clone(), CacheEntry::resolved(1u8))
            .unwrap();

        let bus = InvalidationBus::new();
        let id = bus.register(Arc::from(vec!["a".to_owned()]));
        assert!(bus.unregister(id));
        assert!(!bus.unregister(id));
        assert!(bus.is_empty());

        // A stale id publishes nothing
        assert_eq!(bus.publish(id, &cache), 0);
        assert_eq!(cache.len("a"), 1);
    }
}
