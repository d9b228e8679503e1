//! Operator-graph representation for parameter-shared clones.
//!
//! A [`template::TemplateGraph`] describes one step of the recurrent
//! computation; [`clone_set::CloneSet`] replicates it across time steps,
//! sharing parameters by reference while giving every step its own
//! intermediate tensor instances.

pub mod clone_set;
pub mod node;
pub mod template;

pub use clone_set::{
    CloneSet, Export, ExportScope, LinearParams, ParamKey, Parameter, Place, Recurrence,
    TensorKind,
};
pub use node::{LinearSpec, NarrowSpec, Node, NodeId, OpKind, Role, TensorId};
pub use template::{TemplateBuilder, TemplateGraph};
