//! Greedy interval-graph buffer assignment.
//!
//! Intervals arrive sorted by birth. A slot freed by a dead interval returns
//! to the pool and is reused for the next interval it can hold, preferring an
//! exact capacity match, then the smallest sufficient slot, with ties broken
//! by slot creation order. The result is deterministic for a given trace.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, BTreeSet, HashMap};

use anyhow::Result;
use serde::Serialize;

use crate::error::inconsistency;
use crate::hashing::hash_serializable;
use crate::tensor::DType;

use super::liveness::LiveInterval;
use super::trace::InstanceKey;

/// One physical buffer slot. Capacity is in elements; the backing storage is
/// created by the applier, not here.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SlotPlan {
    pub capacity: usize,
}

/// Memory-sharing summary for one optimization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SharingReport {
    /// Bytes the instances would occupy with one buffer each.
    pub total_bytes: usize,
    /// Bytes saved by slot reuse.
    pub shared_bytes: usize,
}

impl SharingReport {
    /// Bytes actually allocated across all slots.
    pub fn allocated_bytes(&self) -> usize {
        self.total_bytes - self.shared_bytes
    }

    /// Fraction of naive usage eliminated by sharing.
    pub fn ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.shared_bytes as f64 / self.total_bytes as f64
        }
    }
}

/// A complete instance-to-slot mapping, reusable across batch widths because
/// lifetimes depend on topology only.
#[derive(Debug)]
pub struct SlotAssignment {
    pub slots: Vec<SlotPlan>,
    pub by_instance: HashMap<InstanceKey, usize>,
    /// Instances in first-write order, the order the applier commits in.
    pub order: Vec<InstanceKey>,
    pub fingerprint: u64,
    pub report: SharingReport,
}

/// Assigns every interval to a slot. Intervals must be sorted by birth.
pub fn assign(intervals: &[LiveInterval]) -> Result<SlotAssignment> {
    let mut slots: Vec<SlotPlan> = Vec::new();
    let mut by_instance: HashMap<InstanceKey, usize> = HashMap::new();
    let mut order: Vec<InstanceKey> = Vec::with_capacity(intervals.len());

    // Slots currently occupied, keyed by the occupant's death.
    let mut busy: BinaryHeap<Reverse<(usize, usize)>> = BinaryHeap::new();
    // Free slots ordered by (capacity, creation index).
    let mut free: BTreeSet<(usize, usize)> = BTreeSet::new();

    let mut total_bytes = 0usize;

    for interval in intervals {
        total_bytes += interval.bytes;

        while let Some(&Reverse((death, slot))) = busy.peek() {
            if death >= interval.birth {
                break;
            }
            busy.pop();
            free.insert((slots[slot].capacity, slot));
        }

        // Ordered by capacity, so an exact fit is found before any wider
        // slot, and equal capacities fall back to creation order.
        let need = interval.elements;
        let chosen = free.range((need, 0)..).next().copied();

        let slot = match chosen {
            Some(entry) => {
                free.remove(&entry);
                entry.1
            }
            None => {
                slots.push(SlotPlan { capacity: need });
                slots.len() - 1
            }
        };

        if by_instance.insert(interval.key, slot).is_some() {
            return Err(inconsistency(format!(
                "instance {:?} assigned twice",
                interval.key
            )));
        }
        order.push(interval.key);
        busy.push(Reverse((interval.death, slot)));
    }

    let allocated_bytes: usize = slots
        .iter()
        .map(|slot| slot.capacity * DType::F32.size_in_bytes())
        .sum();
    let report = SharingReport {
        total_bytes,
        shared_bytes: total_bytes.saturating_sub(allocated_bytes),
    };

    let mut digest: Vec<(InstanceKey, u32, usize)> = by_instance
        .iter()
        .map(|(&key, &slot)| (key, slot as u32, slots[slot].capacity))
        .collect();
    digest.sort();
    let fingerprint = hash_serializable(&digest)?;

    Ok(SlotAssignment {
        slots,
        by_instance,
        order,
        fingerprint,
        report,
    })
}
