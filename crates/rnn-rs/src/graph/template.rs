//! Template graphs and the typed builder that constructs them.
//!
//! A template describes one step of the recurrent computation: external
//! boundary inputs, operator nodes in a stable traversal order, and the
//! tensor positions they produce. Wiring problems are structural errors
//! surfaced at `finish`, before any clone is created.

use anyhow::Result;
use smallvec::{smallvec, SmallVec};

use crate::error::structural;

use super::node::{LinearSpec, NarrowSpec, Node, NodeId, OpKind, Role, TensorId};

#[derive(Debug, Clone)]
pub(crate) struct TensorDecl {
    pub name: String,
}

/// One step of the recurrent computation, replicated by [`super::CloneSet`].
#[derive(Debug, Clone)]
pub struct TemplateGraph {
    name: String,
    tensors: Vec<TensorDecl>,
    nodes: Vec<Node>,
    inputs: Vec<TensorId>,
    producers: Vec<Option<NodeId>>,
}

impl TemplateGraph {
    pub fn builder(name: &str) -> TemplateBuilder {
        TemplateBuilder {
            name: name.to_string(),
            tensors: Vec::new(),
            nodes: Vec::new(),
            inputs: Vec::new(),
            producers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes in their stable traversal (execution) order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    pub fn tensor_name(&self, id: TensorId) -> &str {
        &self.tensors[id.0 as usize].name
    }

    /// External boundary inputs: tensors without a producing node.
    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    /// The node producing `id`, or `None` for external inputs.
    pub fn producer(&self, id: TensorId) -> Option<NodeId> {
        self.producers[id.0 as usize]
    }

    pub fn is_external(&self, id: TensorId) -> bool {
        self.producers[id.0 as usize].is_none()
    }
}

/// Typed construction API for template graphs. Every emitter returns the
/// output tensor of the operator it appended.
pub struct TemplateBuilder {
    name: String,
    tensors: Vec<TensorDecl>,
    nodes: Vec<Node>,
    inputs: Vec<TensorId>,
    producers: Vec<Option<NodeId>>,
}

impl TemplateBuilder {
    fn declare(&mut self, name: &str) -> TensorId {
        let id = TensorId(self.tensors.len() as u32);
        self.tensors.push(TensorDecl {
            name: name.to_string(),
        });
        self.producers.push(None);
        id
    }

    fn emit(
        &mut self,
        op: OpKind,
        role: Role,
        name: Option<&str>,
        inputs: SmallVec<[TensorId; 4]>,
        out_name: &str,
    ) -> TensorId {
        let out = self.declare(out_name);
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            id,
            op,
            role,
            name: name.map(str::to_string),
            inputs,
            outputs: smallvec![out],
        });
        self.producers[out.0 as usize] = Some(id);
        out
    }

    /// Declares an external boundary input.
    pub fn input(&mut self, name: &str) -> TensorId {
        let id = self.declare(name);
        self.inputs.push(id);
        id
    }

    /// Appends a fully connected projection; `name` is the parameter path.
    pub fn linear(
        &mut self,
        name: &str,
        role: Role,
        input: TensorId,
        in_features: usize,
        out_features: usize,
    ) -> TensorId {
        self.emit(
            OpKind::Linear(LinearSpec {
                in_features,
                out_features,
            }),
            role,
            Some(name),
            smallvec![input],
            name,
        )
    }

    pub fn add(&mut self, name: &str, a: TensorId, b: TensorId) -> TensorId {
        self.emit(OpKind::Add, Role::Generic, None, smallvec![a, b], name)
    }

    pub fn mul(&mut self, name: &str, a: TensorId, b: TensorId) -> TensorId {
        self.emit(OpKind::Mul, Role::Generic, None, smallvec![a, b], name)
    }

    pub fn sigmoid(&mut self, name: &str, x: TensorId) -> TensorId {
        self.emit(OpKind::Sigmoid, Role::Generic, None, smallvec![x], name)
    }

    pub fn tanh(&mut self, name: &str, x: TensorId) -> TensorId {
        self.emit(OpKind::Tanh, Role::Generic, None, smallvec![x], name)
    }

    /// Appends a positional column slice of `len` columns starting at `offset`.
    pub fn narrow(&mut self, name: &str, x: TensorId, offset: usize, len: usize) -> TensorId {
        self.emit(
            OpKind::Narrow(NarrowSpec { offset, len }),
            Role::Generic,
            None,
            smallvec![x],
            name,
        )
    }

    /// Validates wiring and freezes the template.
    pub fn finish(self) -> Result<TemplateGraph> {
        if self.nodes.is_empty() {
            return Err(structural(format!(
                "template '{}' declares no operators",
                self.name
            )));
        }
        for node in &self.nodes {
            for input in &node.inputs {
                let idx = input.0 as usize;
                if idx >= self.tensors.len() {
                    return Err(structural(format!(
                        "node {:?} in template '{}' references unknown tensor {:?}",
                        node.id, self.name, input
                    )));
                }
                let external = self.inputs.contains(input);
                if self.producers[idx].is_none() && !external {
                    return Err(structural(format!(
                        "tensor '{}' consumed by node {:?} has no producer and is not an input",
                        self.tensors[idx].name, node.id
                    )));
                }
            }
        }
        for input in &self.inputs {
            if self.producers[input.0 as usize].is_some() {
                return Err(structural(format!(
                    "external input '{}' also has a producer",
                    self.tensors[input.0 as usize].name
                )));
            }
        }
        Ok(TemplateGraph {
            name: self.name,
            tensors: self.tensors,
            nodes: self.nodes,
            inputs: self.inputs,
            producers: self.producers,
        })
    }
}
