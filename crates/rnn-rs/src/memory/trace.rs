//! Calibration traces: the totally ordered read/write log the liveness
//! analyzer consumes.

use serde::Serialize;

use crate::graph::{NodeId, Place, TensorKind};

/// Globally unique address of one tensor instance's buffer across every
/// clone set participating in an optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InstanceKey {
    pub graph: u16,
    pub place: Place,
    pub kind: TensorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Forward,
    Backward,
}

/// One executed operator instance. `writes` carries the element count of
/// each produced buffer so the allocator can size slots.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub graph: u16,
    pub clone: u32,
    pub node: NodeId,
    pub phase: Phase,
    pub reads: Vec<InstanceKey>,
    pub writes: Vec<(InstanceKey, usize)>,
}

/// The full log of one calibration run, in execution order.
#[derive(Debug, Default)]
pub struct ExecutionTrace {
    pub events: Vec<TraceEvent>,
}

impl ExecutionTrace {
    pub fn push(&mut self, event: TraceEvent) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
