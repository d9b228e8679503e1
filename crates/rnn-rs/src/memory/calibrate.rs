//! One-shot calibration run producing the execution trace.
//!
//! Calibration shrinks the sample batch to a single row before running:
//! lifetimes depend on topology, not batch width, and a one-row run keeps
//! the throwaway forward/backward pass cheap. Gradients and parameter
//! accumulators are scratch output here; the caller resets them afterwards.

use anyhow::{Context, Result};

use crate::exec::{self, SampleBatch, SumCriterion};
use crate::graph::CloneSet;

use super::trace::ExecutionTrace;

pub fn run(sets: &mut [CloneSet], sample: &SampleBatch) -> Result<ExecutionTrace> {
    let narrow = sample
        .shrunk(1)
        .context("shrinking the calibration batch")?;
    exec::run(sets, &narrow, &SumCriterion, true)
}
