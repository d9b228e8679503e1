//! Structural signatures and the global assignment cache.
//!
//! Two optimizations of structurally identical clone sets produce identical
//! slot assignments, so assignments are memoized behind a signature of the
//! structure that determines lifetimes. Batch width is deliberately absent
//! from the signature: it changes buffer sizes at bind time, never the
//! sharing decision.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use lru::LruCache;
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::graph::{CloneSet, Export, Node, Recurrence};
use crate::hashing::{fnv1a_bytes, fnv1a_init};
use crate::profiling;

use super::alloc::SlotAssignment;

const CACHE_CAPACITY: usize = 32;

static ASSIGNMENT_CACHE: Lazy<Mutex<LruCache<u64, Arc<SlotAssignment>>>> = Lazy::new(|| {
    Mutex::new(LruCache::new(
        std::num::NonZeroUsize::new(CACHE_CAPACITY).expect("cache capacity is non-zero"),
    ))
});

#[derive(Serialize)]
struct SetSignature<'a> {
    steps: usize,
    tensor_count: usize,
    inputs: &'a [crate::graph::TensorId],
    nodes: &'a [Node],
    recurrences: &'a [Recurrence],
    exports: &'a [Export],
}

/// Hashes everything about `sets` that influences the calibration trace.
pub fn cache_key(sets: &[CloneSet]) -> Result<u64> {
    let mut hash = fnv1a_init();
    hash = fnv1a_bytes(hash, &(sets.len() as u64).to_le_bytes());
    for set in sets {
        let signature = SetSignature {
            steps: set.steps(),
            tensor_count: set.template().tensor_count(),
            inputs: set.template().inputs(),
            nodes: set.template().nodes(),
            recurrences: set.recurrences(),
            exports: set.exports(),
        };
        let bytes = bincode::serialize(&signature)?;
        hash = fnv1a_bytes(hash, &bytes);
    }
    Ok(hash)
}

pub fn lookup(key: u64) -> Option<Arc<SlotAssignment>> {
    let mut cache = ASSIGNMENT_CACHE.lock().expect("assignment cache poisoned");
    match cache.get(&key) {
        Some(assignment) => {
            profiling::cache_event("assignment_cache_hit");
            Some(Arc::clone(assignment))
        }
        None => {
            profiling::cache_event("assignment_cache_miss");
            None
        }
    }
}

pub fn insert(key: u64, assignment: Arc<SlotAssignment>) {
    let mut cache = ASSIGNMENT_CACHE.lock().expect("assignment cache poisoned");
    cache.put(key, assignment);
}
