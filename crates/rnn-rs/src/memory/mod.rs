//! Cross-clone memory optimization pipeline.
//!
//! `optimize` runs the full chain: calibrate once on a one-row batch, extract
//! live intervals from the trace, greedily assign instances to shared buffer
//! slots, and rewrite the clone sets' storage in place. Assignments are
//! memoized by structural signature, so re-optimizing an identical
//! configuration skips straight to application.

pub mod alloc;
pub mod apply;
pub mod calibrate;
pub mod liveness;
pub mod plan;
pub mod trace;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, ensure, Result};

use crate::error::OptimizerError;
use crate::exec::SampleBatch;
use crate::graph::{CloneSet, TensorKind};
use crate::profiling;

pub use alloc::{SharingReport, SlotAssignment};
pub use liveness::LiveInterval;
pub use trace::{ExecutionTrace, InstanceKey, Phase, TraceEvent};

/// Instances whose storage must never be aliased: caller-fed inputs, initial
/// recurrent states, and exported outputs, both values and gradients.
/// Parameters are pinned by construction and never enter the trace at all.
pub fn pinned_keys(sets: &[CloneSet]) -> HashSet<InstanceKey> {
    let mut pinned = HashSet::new();
    let mut pin = |graph: u16, place| {
        for kind in [TensorKind::Value, TensorKind::Grad] {
            pinned.insert(InstanceKey { graph, place, kind });
        }
    };
    for (gi, set) in sets.iter().enumerate() {
        let graph = gi as u16;
        for input in set.feed_inputs() {
            for clone in 0..set.steps() as u32 {
                pin(
                    graph,
                    crate::graph::Place::Step {
                        clone,
                        tensor: input,
                    },
                );
            }
        }
        for rec in set.recurrences() {
            for slot in 0..rec.lag.min(set.steps()) as u32 {
                pin(
                    graph,
                    crate::graph::Place::Initial {
                        tensor: rec.input,
                        slot,
                    },
                );
            }
        }
        for place in set.export_places() {
            pin(graph, place);
        }
    }
    pinned
}

/// Optimizes the sets' buffer usage in place and reports the savings.
///
/// Failures before any storage is rewritten leave the sets fully usable with
/// their original independent buffers; the caller may keep training without
/// sharing.
pub fn optimize(sets: &mut [CloneSet], sample: &SampleBatch) -> Result<SharingReport> {
    ensure!(!sets.is_empty(), "no clone sets to optimize");

    let key = plan::cache_key(sets)?;
    if sets.iter().all(CloneSet::is_calibrated) {
        if let Some(assignment) = plan::lookup(key) {
            apply::apply(sets, &assignment)?;
            return Ok(assignment.report);
        }
    }

    let trace = calibrate::run(sets, sample)
        .map_err(|err| anyhow!(OptimizerError::Calibration(format!("{err:#}"))))?;
    for set in sets.iter() {
        set.zero_param_grads();
    }

    let pinned = pinned_keys(sets);
    let intervals = liveness::analyze(&trace, &pinned)?;
    let assignment = Arc::new(alloc::assign(&intervals)?);
    apply::apply(sets, &assignment)?;
    profiling::cache_event("optimizer_pipeline_run");

    let report = assignment.report;
    plan::insert(key, assignment);
    Ok(report)
}
