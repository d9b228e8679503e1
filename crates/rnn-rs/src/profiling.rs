//! Process-global event counters for cache behavior and pipeline runs.
//!
//! Deliberately small: the optimizer runs once per model configuration, so a
//! counter snapshot is enough to observe cache hits and pipeline reruns in
//! tests and in the surrounding training driver.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

fn counters() -> &'static Mutex<HashMap<&'static str, u64>> {
    static COUNTERS: OnceLock<Mutex<HashMap<&'static str, u64>>> = OnceLock::new();
    COUNTERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Records one occurrence of a named cache or pipeline event.
pub fn cache_event(name: &'static str) {
    let mut guard = counters().lock().expect("profiling counters poisoned");
    *guard.entry(name).or_insert(0) += 1;
}

/// Returns the current count for a named event.
pub fn event_count(name: &str) -> u64 {
    let guard = counters().lock().expect("profiling counters poisoned");
    guard.get(name).copied().unwrap_or(0)
}

/// Snapshots all counters, sorted by event name.
pub fn snapshot() -> Vec<(&'static str, u64)> {
    let guard = counters().lock().expect("profiling counters poisoned");
    let mut entries: Vec<_> = guard.iter().map(|(k, v)| (*k, *v)).collect();
    entries.sort_by_key(|(name, _)| *name);
    entries
}

/// Clears every counter.
pub fn reset() {
    let mut guard = counters().lock().expect("profiling counters poisoned");
    guard.clear();
}
