use std::env;
use std::sync::OnceLock;

use crate::executor::DEFAULT_STEP_CACHE_CAPACITY;

static LAZE_STEP_CACHE: OnceLock<usize> = OnceLock::new();
static LAZE_STEP_TRACE: OnceLock<Option<String>> = OnceLock::new();

/// Step cache capacity from `LAZE_STEP_CACHE`; `0` disables caching.
pub(crate) fn step_cache_capacity() -> usize {
    *LAZE_STEP_CACHE.get_or_init(|| match env::var("LAZE_STEP_CACHE") {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .unwrap_or(DEFAULT_STEP_CACHE_CAPACITY),
        _ => DEFAULT_STEP_CACHE_CAPACITY,
    })
}

/// JSONL step trace destination from `LAZE_STEP_TRACE`, if set.
pub(crate) fn step_trace_path() -> Option<&'static str> {
    LAZE_STEP_TRACE
        .get_or_init(|| match env::var("LAZE_STEP_TRACE") {
            Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
            _ => None,
        })
        .as_deref()
}
