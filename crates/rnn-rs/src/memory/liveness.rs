//! Live-interval extraction over a calibration trace.
//!
//! The trace is straight-line code: one total order, no branches. Each
//! non-pinned instance's lifetime is the closed interval from the event that
//! first writes it to the event that last touches it. Within a single event,
//! writes happen before reads, so an operator whose output aliases one of its
//! inputs would still see both intervals overlap at that event.

use std::collections::{BTreeMap, HashSet};

use anyhow::Result;

use crate::error::inconsistency;
use crate::tensor::DType;

use super::trace::{ExecutionTrace, InstanceKey};

/// Lifetime of one buffer instance, in event indices. `death` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveInterval {
    pub key: InstanceKey,
    pub birth: usize,
    pub death: usize,
    pub elements: usize,
    pub bytes: usize,
}

/// Computes live intervals for every non-pinned instance in the trace.
/// Pinned instances (parameters excluded upstream, feeds, initial states,
/// exports) never enter the result and so never share a slot.
pub fn analyze(
    trace: &ExecutionTrace,
    pinned: &HashSet<InstanceKey>,
) -> Result<Vec<LiveInterval>> {
    let mut intervals: BTreeMap<InstanceKey, LiveInterval> = BTreeMap::new();

    for (idx, event) in trace.events.iter().enumerate() {
        for &(key, elements) in &event.writes {
            if pinned.contains(&key) {
                continue;
            }
            let entry = intervals.entry(key).or_insert(LiveInterval {
                key,
                birth: idx,
                death: idx,
                elements,
                bytes: elements * DType::F32.size_in_bytes(),
            });
            entry.death = idx;
            if elements > entry.elements {
                entry.elements = elements;
                entry.bytes = elements * DType::F32.size_in_bytes();
            }
        }
        for &key in &event.reads {
            if pinned.contains(&key) {
                continue;
            }
            match intervals.get_mut(&key) {
                Some(entry) => entry.death = idx,
                None => {
                    return Err(inconsistency(format!(
                        "event {idx} reads {key:?} before any write"
                    )))
                }
            }
        }
    }

    let mut out: Vec<LiveInterval> = intervals.into_values().collect();
    out.sort_by_key(|interval| (interval.birth, interval.key));
    Ok(out)
}
