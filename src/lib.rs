//! rcache - In-process request cache with mutation-driven invalidation
//!
//! This library sits between callers and host-supplied async fetch functions:
//! - Read accessors are wrapped with [`CacheCoordinator::cached`]; results are
//!   cached per group under a key derived from the call arguments
//! - Concurrent identical reads share a single underlying fetch
//! - Mutating accessors are wrapped with [`CacheCoordinator::invalidates`];
//!   on success they evict their paired groups before returning
//!
//! The cache never performs I/O itself and has no expiry: entries live until
//! their group is evicted.

mod config;
mod error;
mod invalidation;
mod key;
mod multiplexer;
mod registry;
mod request_cache;
mod stats;

pub mod case_cache;

pub use case_cache::{CaseBackend, CaseCache, RelatedCaseRequest};
pub use config::CacheConfig;
pub use error::{BoxError, CacheError, SharedError};
pub use invalidation::{InvalidationBus, MutatorId};
pub use key::CacheKey;
pub use multiplexer::{InFlight, SubscriptionMultiplexer};
pub use registry::{CacheCoordinator, CachedFn, InvalidatingFn};
pub use request_cache::{CacheEntry, CacheGroup, RequestCache};
pub use stats::CacheStatsSnapshot;

// Re-export async_trait for convenience
pub use async_trait::async_trait;
