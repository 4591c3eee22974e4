//! Process-wide monotonic counters for executor events.
//!
//! Counters are cheap enough to stay always-on; they back the step cache
//! hit/miss accounting and give tests an observable for registry and step
//! activity. Names are dotted paths such as `mark_step.calls` or
//! `step_cache.hit`.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

static COUNTERS: Lazy<Mutex<HashMap<&'static str, u64>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Increments `name` by one.
pub fn inc(name: &'static str) {
    add(name, 1);
}

/// Increments `name` by `delta`, saturating at `u64::MAX`.
pub fn add(name: &'static str, delta: u64) {
    let mut counters = COUNTERS.lock().expect("metrics counters poisoned");
    let entry = counters.entry(name).or_insert(0);
    *entry = entry.saturating_add(delta);
}

/// Current value of `name`, zero when never incremented.
pub fn value(name: &str) -> u64 {
    let counters = COUNTERS.lock().expect("metrics counters poisoned");
    counters.get(name).copied().unwrap_or(0)
}

/// Snapshot of all counters, sorted by name.
pub fn snapshot() -> Vec<(&'static str, u64)> {
    let counters = COUNTERS.lock().expect("metrics counters poisoned");
    let mut entries: Vec<_> = counters.iter().map(|(name, value)| (*name, *value)).collect();
    entries.sort_by_key(|(name, _)| *name);
    entries
}

/// Clears every counter.
pub fn reset() {
    let mut counters = COUNTERS.lock().expect("metrics counters poisoned");
    counters.clear();
}
