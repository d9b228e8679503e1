//! Operator nodes and the identifiers used to wire them together.

use serde::Serialize;
use smallvec::SmallVec;

/// Identifies an operator node within a template graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub u32);

/// Identifies a tensor position within a template graph. Each clone
/// instantiates its own tensor for every template position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TensorId(pub u32);

/// Typed role resolved at graph construction time, replacing runtime name
/// matching when parameter-bearing nodes must be distinguished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Role {
    InputProjection,
    HiddenProjection,
    Generic,
}

/// Configuration of a fully connected projection `y = x W + b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinearSpec {
    pub in_features: usize,
    pub out_features: usize,
}

/// Configuration of a positional column slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NarrowSpec {
    pub offset: usize,
    pub len: usize,
}

/// Operator kinds known to the reference executor. The optimizer treats them
/// as opaque; only their read/write sets matter for liveness.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum OpKind {
    Linear(LinearSpec),
    Add,
    Mul,
    Sigmoid,
    Tanh,
    Narrow(NarrowSpec),
}

/// A single operator in a template graph. Immutable after construction; the
/// aliasing applier rewrites tensor storage, never node wiring.
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub op: OpKind,
    pub role: Role,
    /// Parameter path name for parameter-bearing nodes.
    pub name: Option<String>,
    pub inputs: SmallVec<[TensorId; 4]>,
    pub outputs: SmallVec<[TensorId; 2]>,
}

impl Node {
    /// Returns the single output of this node. Every operator kind currently
    /// produces exactly one tensor.
    pub fn output(&self) -> TensorId {
        self.outputs[0]
    }
}
