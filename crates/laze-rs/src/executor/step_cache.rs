//! Program cache keyed by structural step fingerprints.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::backend::spec::Program;
use crate::env;
use crate::metrics;

/// Default number of cached step programs retained before LRU eviction.
pub(crate) const DEFAULT_STEP_CACHE_CAPACITY: usize = 64;

/// Configures how an executor caches lowered step programs.
pub enum CachePolicy {
    Disabled,
    Enabled { capacity: usize },
}

impl Default for CachePolicy {
    fn default() -> Self {
        match env::step_cache_capacity() {
            0 => CachePolicy::Disabled,
            capacity => CachePolicy::Enabled { capacity },
        }
    }
}

/// Structural fingerprint of one step's lowered graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StepKey {
    pub(crate) hash: u64,
}

/// Wraps an optional LRU so caching-enabled and caching-disabled executors
/// share one code path.
pub(crate) enum StepCacheState {
    Disabled,
    Enabled(Mutex<LruCache<StepKey, Arc<Program>>>),
}

impl StepCacheState {
    pub(crate) fn from_policy(policy: CachePolicy) -> Self {
        match policy {
            CachePolicy::Disabled => StepCacheState::Disabled,
            CachePolicy::Enabled { capacity } => match NonZeroUsize::new(capacity) {
                Some(capacity) => StepCacheState::Enabled(Mutex::new(LruCache::new(capacity))),
                None => StepCacheState::Disabled,
            },
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        matches!(self, StepCacheState::Enabled(_))
    }

    pub(crate) fn get(&self, key: &StepKey) -> Option<Arc<Program>> {
        match self {
            StepCacheState::Disabled => None,
            StepCacheState::Enabled(cache) => {
                let mut guard = cache.lock().expect("step cache poisoned");
                guard.get(key).cloned()
            }
        }
    }

    pub(crate) fn insert(&self, key: StepKey, program: Arc<Program>) {
        if let StepCacheState::Enabled(cache) = self {
            let mut guard = cache.lock().expect("step cache poisoned");
            if let Some((evicted, _)) = guard.push(key, program) {
                if evicted != key {
                    metrics::inc("step_cache.evict");
                }
            }
        }
    }
}
