//! Aliasing applier: commits a slot assignment onto live clone sets.
//!
//! Application is validate-then-commit. Every instance in the assignment is
//! checked against the sets first; only when the whole assignment is
//! applicable does any storage handle change. A failed validation therefore
//! leaves the sets exactly as they were.

use anyhow::Result;

use crate::error::inconsistency;
use crate::graph::CloneSet;
use crate::tensor::Storage;

use super::alloc::SlotAssignment;

/// Rebinds instance storage to shared slot buffers. Idempotent: sets already
/// carrying this assignment's fingerprint are left untouched.
pub fn apply(sets: &mut [CloneSet], assignment: &SlotAssignment) -> Result<()> {
    if sets
        .iter()
        .all(|set| set.applied_fingerprint() == Some(assignment.fingerprint))
    {
        return Ok(());
    }

    for &key in &assignment.order {
        let set = sets.get(key.graph as usize).ok_or_else(|| {
            inconsistency(format!(
                "assignment references set {} but only {} exist",
                key.graph,
                sets.len()
            ))
        })?;
        if !assignment.by_instance.contains_key(&key) {
            return Err(inconsistency(format!(
                "instance {key:?} is ordered but has no slot"
            )));
        }
        set.shape_of(key.place).map_err(|err| {
            inconsistency(format!(
                "instance {key:?} is not calibrated: {err}"
            ))
        })?;
    }

    let buffers: Vec<Storage> = assignment
        .slots
        .iter()
        .map(|slot| Storage::zeros(slot.capacity))
        .collect();

    // Commit in first-write order so a debugger walking instances sees
    // buffers appear in the same order calibration produced them.
    for &key in &assignment.order {
        let slot = assignment.by_instance[&key];
        sets[key.graph as usize].set_storage(key.place, key.kind, buffers[slot].clone())?;
    }
    for set in sets.iter_mut() {
        set.set_applied_fingerprint(assignment.fingerprint);
    }
    Ok(())
}
