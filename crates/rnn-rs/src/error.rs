//! Error taxonomy for the memory-optimization pipeline.
//!
//! Every error here is fatal for the current optimization attempt. A
//! `Calibration` failure tells the caller to fall back to independently
//! allocated buffers; `Structural` and `Inconsistency` indicate bugs in graph
//! construction or in an upstream pipeline stage and are never retried.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptimizerError {
    /// Malformed graph wiring detected at construction time.
    #[error("structural error: {0}")]
    Structural(String),
    /// An operator failed during the one-shot calibration run.
    #[error("calibration failed: {0}")]
    Calibration(String),
    /// An internal invariant violation between pipeline stages.
    #[error("allocation inconsistency: {0}")]
    Inconsistency(String),
}

pub(crate) fn structural(msg: impl Into<String>) -> anyhow::Error {
    OptimizerError::Structural(msg.into()).into()
}

pub(crate) fn inconsistency(msg: impl Into<String>) -> anyhow::Error {
    OptimizerError::Inconsistency(msg.into()).into()
}
