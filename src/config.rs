//! Coordinator configuration

/// Configuration for the cache coordinator
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Initial capacity of each group's entry table
    pub initial_group_capacity: usize,
    /// Reject `invalidates` registrations that target a group not yet
    /// registered through `cached`
    pub strict_invalidation_targets: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            initial_group_capacity: 16,
            strict_invalidation_targets: false,
        }
    }
}

impl CacheConfig {
    /// Sets the initial capacity of each group's entry table
    pub fn with_initial_group_capacity(mut self, capacity: usize) -> Self {
        self.initial_group_capacity = capacity;
        self
    }

    /// Requires invalidation targets to be registered read groups
    pub fn with_strict_invalidation_targets(mut self, strict: bool) -> Self {
        self.strict_invalidation_targets = strict;
        self
    }
}
